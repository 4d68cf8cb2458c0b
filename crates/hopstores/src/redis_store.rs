//! Redis-backed context and global stores.
//!
//! Trace state is a plain string value under a namespaced key with a long
//! TTL; finishing a trace shortens that TTL instead of deleting, so late
//! deliveries still find the finished flag. Liveness is a Redis set per
//! pipeline whose TTL each keep-alive refreshes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::info;

use hopcore::store::{ContextStore, GlobalStore};
use hopcore::StoreError;

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Key namespace shared by every store of one deployment.
    pub namespace: String,
    /// How long live trace state is kept without any write.
    pub retention: Duration,
    /// How long finished trace state lingers before Redis reclaims it.
    pub linger: Duration,
    /// How long a host stays in the liveness sets after its last
    /// keep-alive.
    pub liveness_ttl: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        RedisStoreConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "hopflow".to_string(),
            retention: Duration::from_secs(7 * 24 * 3600),
            linger: Duration::from_secs(300),
            liveness_ttl: Duration::from_secs(90),
        }
    }
}

pub struct RedisContextStore {
    manager: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisContextStore {
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        info!("connecting context store to {}", config.url);
        let client = Client::open(config.url.as_str()).map_err(backend)?;
        let manager = client.get_connection_manager().await.map_err(backend)?;
        Ok(RedisContextStore { manager, config })
    }

    fn key(&self, trace_id: &str) -> String {
        format!("{}:cx:{trace_id}", self.config.namespace)
    }
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn get(&self, trace_id: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.manager.clone();
        con.get(self.key(trace_id)).await.map_err(backend)
    }

    async fn put(&self, trace_id: &str, state: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        con.set_ex(self.key(trace_id), state, self.config.retention.as_secs())
            .await
            .map_err(backend)
    }

    async fn expire(&self, trace_id: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: bool = con
            .expire(self.key(trace_id), self.config.linger.as_secs() as i64)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, trace_id: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        con.del(self.key(trace_id)).await.map_err(backend)
    }
}

pub struct RedisGlobalStore {
    manager: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisGlobalStore {
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        info!("connecting global store to {}", config.url);
        let client = Client::open(config.url.as_str()).map_err(backend)?;
        let manager = client.get_connection_manager().await.map_err(backend)?;
        Ok(RedisGlobalStore { manager, config })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:g:{key}", self.config.namespace)
    }

    fn alive_key(&self, pipeline: &str) -> String {
        format!("{}:alive:{pipeline}", self.config.namespace)
    }

    fn hosts_key(&self) -> String {
        format!("{}:hosts", self.config.namespace)
    }
}

#[async_trait]
impl GlobalStore for RedisGlobalStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut con = self.manager.clone();
        con.incr(self.key(key), 1i64).await.map_err(backend)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut con = self.manager.clone();
        con.decr(self.key(key), 1i64).await.map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.manager.clone();
        con.get(self.key(key)).await.map_err(backend)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        con.set(self.key(key), value).await.map_err(backend)
    }

    async fn keep_alive(&self, pipeline: &str, host_ip: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let ttl = self.config.liveness_ttl.as_secs() as i64;
        let alive = self.alive_key(pipeline);
        let hosts = self.hosts_key();
        let _: () = con.sadd(&alive, host_ip).await.map_err(backend)?;
        let _: bool = con.expire(&alive, ttl).await.map_err(backend)?;
        let _: () = con.sadd(&hosts, host_ip).await.map_err(backend)?;
        let _: bool = con.expire(&hosts, ttl).await.map_err(backend)?;
        Ok(())
    }

    async fn alive_count(&self, pipeline: &str) -> Result<i64, StoreError> {
        let mut con = self.manager.clone();
        con.scard(self.alive_key(pipeline)).await.map_err(backend)
    }

    async fn host_ips(&self) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        con.smembers(self.hosts_key()).await.map_err(backend)
    }
}
