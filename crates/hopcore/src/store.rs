//! Storage SPIs and the retry protection installed over them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;

/// Persistence for per-trace execution state. Implementations store the
/// dumped string opaquely; the engine owns (de)serialization.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, trace_id: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, trace_id: &str, state: &str) -> Result<(), StoreError>;
    /// Retire a finished trace: shorten its retention so the backend
    /// reclaims it soon. The state stays readable until then; late
    /// deliveries rely on finding the finished flag rather than a void.
    async fn expire(&self, trace_id: &str) -> Result<(), StoreError>;
    async fn remove(&self, trace_id: &str) -> Result<(), StoreError>;
}

/// Cross-process shared state: counters for fan-in arrival and backlog
/// tracking, plain keys, and liveness registration per pipeline.
#[async_trait]
pub trait GlobalStore: Send + Sync {
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn keep_alive(&self, pipeline: &str, host_ip: &str) -> Result<(), StoreError>;
    async fn alive_count(&self, pipeline: &str) -> Result<i64, StoreError>;
    async fn host_ips(&self) -> Result<Vec<String>, StoreError>;
}

/// Backoff applied when a store call fails transiently.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            delay_ms: 50,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

macro_rules! with_retries {
    ($self:ident, $op:literal, $call:expr) => {{
        let mut attempt = 0;
        loop {
            match $call {
                Ok(value) => break Ok(value),
                Err(err) if attempt + 1 < $self.policy.max_attempts => {
                    warn!("store {} failed (attempt {}): {err}", $op, attempt + 1);
                    tokio::time::sleep($self.policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        }
    }};
}

/// Retry wrapper every engine installs over its context store.
pub struct RetryingContextStore {
    inner: Arc<dyn ContextStore>,
    policy: RetryPolicy,
}

impl RetryingContextStore {
    pub fn new(inner: Arc<dyn ContextStore>, policy: RetryPolicy) -> Self {
        RetryingContextStore { inner, policy }
    }
}

#[async_trait]
impl ContextStore for RetryingContextStore {
    async fn get(&self, trace_id: &str) -> Result<Option<String>, StoreError> {
        with_retries!(self, "get", self.inner.get(trace_id).await)
    }

    async fn put(&self, trace_id: &str, state: &str) -> Result<(), StoreError> {
        with_retries!(self, "put", self.inner.put(trace_id, state).await)
    }

    async fn expire(&self, trace_id: &str) -> Result<(), StoreError> {
        with_retries!(self, "expire", self.inner.expire(trace_id).await)
    }

    async fn remove(&self, trace_id: &str) -> Result<(), StoreError> {
        with_retries!(self, "remove", self.inner.remove(trace_id).await)
    }
}

/// Retry wrapper every engine installs over its global store.
pub struct RetryingGlobalStore {
    inner: Arc<dyn GlobalStore>,
    policy: RetryPolicy,
}

impl RetryingGlobalStore {
    pub fn new(inner: Arc<dyn GlobalStore>, policy: RetryPolicy) -> Self {
        RetryingGlobalStore { inner, policy }
    }
}

#[async_trait]
impl GlobalStore for RetryingGlobalStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        with_retries!(self, "incr", self.inner.incr(key).await)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        with_retries!(self, "decr", self.inner.decr(key).await)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_retries!(self, "get", self.inner.get(key).await)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        with_retries!(self, "put", self.inner.put(key, value).await)
    }

    async fn keep_alive(&self, pipeline: &str, host_ip: &str) -> Result<(), StoreError> {
        with_retries!(self, "keep_alive", self.inner.keep_alive(pipeline, host_ip).await)
    }

    async fn alive_count(&self, pipeline: &str) -> Result<i64, StoreError> {
        with_retries!(self, "alive_count", self.inner.alive_count(pipeline).await)
    }

    async fn host_ips(&self) -> Result<Vec<String>, StoreError> {
        with_retries!(self, "host_ips", self.inner.host_ips().await)
    }
}
