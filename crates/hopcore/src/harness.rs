//! Fully in-memory engine backends for tests and local development.
//!
//! Nothing here leaves the process: traces live in maps, the channel
//! loops back into the engine's own subscriber, and delays ride tokio
//! timers. The memory stores keep the same serialized strings a real
//! backend would, so every access still round-trips the wire format.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::{debug, warn};

use crate::channel::{DelayScheduler, MessageChannel, MessageHandler, StepMessage};
use crate::engine::{Backends, Engine, EngineConfig};
use crate::error::{FlowError, StoreError};
use crate::store::{ContextStore, GlobalStore};

/// Trace state in maps. `expire` parks the state in a holding map that
/// stays readable, mirroring a TTL shortened but not yet fired.
#[derive(Default)]
pub struct MemoryContextStore {
    live: DashMap<String, String>,
    expired: DashMap<String, String>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a retired trace, for assertions on finished pipelines.
    pub fn expired_state(&self, trace_id: &str) -> Option<String> {
        self.expired.get(trace_id).map(|s| s.value().clone())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, trace_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(state) = self.live.get(trace_id) {
            return Ok(Some(state.value().clone()));
        }
        Ok(self.expired.get(trace_id).map(|s| s.value().clone()))
    }

    async fn put(&self, trace_id: &str, state: &str) -> Result<(), StoreError> {
        self.expired.remove(trace_id);
        self.live.insert(trace_id.to_string(), state.to_string());
        Ok(())
    }

    async fn expire(&self, trace_id: &str) -> Result<(), StoreError> {
        if let Some((id, state)) = self.live.remove(trace_id) {
            self.expired.insert(id, state);
        }
        Ok(())
    }

    async fn remove(&self, trace_id: &str) -> Result<(), StoreError> {
        self.live.remove(trace_id);
        self.expired.remove(trace_id);
        Ok(())
    }
}

/// Shared counters, keys, and liveness in maps.
#[derive(Default)]
pub struct MemoryGlobalStore {
    counters: DashMap<String, i64>,
    values: DashMap<String, String>,
    alive: DashMap<String, DashSet<String>>,
}

impl MemoryGlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|c| *c.value()).unwrap_or(0)
    }
}

#[async_trait]
impl GlobalStore for MemoryGlobalStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry -= 1;
        Ok(*entry)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(value) = self.values.get(key) {
            return Ok(Some(value.value().clone()));
        }
        Ok(self.counters.get(key).map(|c| c.value().to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn keep_alive(&self, pipeline: &str, host_ip: &str) -> Result<(), StoreError> {
        self.alive
            .entry(pipeline.to_string())
            .or_default()
            .insert(host_ip.to_string());
        Ok(())
    }

    async fn alive_count(&self, pipeline: &str) -> Result<i64, StoreError> {
        Ok(self
            .alive
            .get(pipeline)
            .map(|hosts| hosts.len() as i64)
            .unwrap_or(0))
    }

    async fn host_ips(&self) -> Result<Vec<String>, StoreError> {
        let mut ips: Vec<String> = Vec::new();
        for hosts in self.alive.iter() {
            for ip in hosts.value().iter() {
                if !ips.contains(ip.key()) {
                    ips.push(ip.key().clone());
                }
            }
        }
        Ok(ips)
    }
}

/// Channel that feeds published messages straight back into the
/// subscriber on a spawned task.
#[derive(Default)]
pub struct LoopbackChannel {
    handler: RwLock<Option<MessageHandler>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageChannel for LoopbackChannel {
    async fn send(&self, message: StepMessage) -> Result<(), FlowError> {
        let handler = self
            .handler
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        let Some(handler) = handler else {
            return Err(FlowError::Channel(
                "loopback channel has no subscriber".to_string(),
            ));
        };
        tokio::spawn(async move {
            if let Err(err) = handler(message).await {
                debug!("loopback redelivery gave up: {err}");
            }
        });
        Ok(())
    }

    async fn subscribe(&self, handler: MessageHandler) -> Result<(), FlowError> {
        match self.handler.write() {
            Ok(mut guard) => {
                *guard = Some(handler);
                Ok(())
            }
            Err(_) => Err(FlowError::Channel(
                "loopback subscriber slot poisoned".to_string(),
            )),
        }
    }
}

/// Delay scheduler backed by tokio timers in this process. Restart loses
/// pending wakeups, which is fine for the tests this exists for.
pub struct SleepDelayScheduler;

#[async_trait]
impl DelayScheduler for SleepDelayScheduler {
    async fn schedule(
        &self,
        engine: Engine,
        trace_id: String,
        step_id: String,
        delay: Duration,
    ) -> Result<(), FlowError> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = engine.resume_delayed(&trace_id, &step_id).await {
                warn!("delayed resume of {step_id} on {trace_id} failed: {err}");
            }
        });
        Ok(())
    }
}

/// An engine wired to in-memory backends, with handles kept for
/// assertions.
pub struct Harness {
    pub engine: Engine,
    pub context_store: Arc<MemoryContextStore>,
    pub global_store: Arc<MemoryGlobalStore>,
}

impl Harness {
    /// Direct dispatch, test mode on. Every hand-off happens inline, so
    /// a launched pipeline runs to its next suspension before returning.
    pub fn new() -> Self {
        Self::with_config(
            EngineConfig::default()
                .with_deliver_async(false)
                .with_test_mode(true),
        )
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let context_store = Arc::new(MemoryContextStore::new());
        let global_store = Arc::new(MemoryGlobalStore::new());
        let engine = Engine::new(
            config,
            Backends {
                context_store: context_store.clone(),
                global_store: global_store.clone(),
                channel: Arc::new(LoopbackChannel::new()),
                resender: None,
                delays: Some(Arc::new(SleepDelayScheduler)),
            },
        );
        Harness {
            engine,
            context_store,
            global_store,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Shorthand for [`Harness::new`].
    pub fn harness() -> Harness {
        Harness::new()
    }
}
