// src/services/cache.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::models::{DividendSnapshot, LiveTaskStatus, TaskStatus};

/// Upper bound on any single cache round trip before the caller gives up.
pub const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// A string key/value store with per-entry expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

#[derive(Clone)]
struct StoredValue {
    payload: Arc<str>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store. Expired entries are never returned.
pub struct MemoryStore {
    cache: Cache<String, StoredValue>,
}

impl MemoryStore {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        MemoryStore { cache }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|v| v.payload.to_string()))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let entry = StoredValue { payload: Arc::from(value), ttl };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }
}

/// Fail-soft JSON cache in front of a `KeyValueStore`.
///
/// Every operation is bounded by `op_timeout`. A slow or broken store turns
/// reads into misses and writes into `false`; nothing is ever propagated.
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn KeyValueStore>,
    default_ttl: Duration,
    op_timeout: Duration,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn KeyValueStore>, default_ttl: Duration) -> Self {
        CacheLayer {
            store,
            default_ttl,
            op_timeout: CACHE_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn dividend_key(netuid: i32, hotkey: &str) -> String {
        format!("dividends:{}:{}", netuid, hotkey)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match timeout(self.op_timeout, self.store.get(key)).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                warn!("Cache get error for {}: {}", key, e);
                return None;
            }
            Err(_) => {
                warn!("Cache get timed out for {}", key);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", key, e);
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);

        match timeout(self.op_timeout, self.store.set_ex(key, payload, ttl)).await {
            Ok(Ok(())) => {
                debug!("Cached {} for {:?}", key, ttl);
                true
            }
            Ok(Err(e)) => {
                warn!("Cache set error for {}: {}", key, e);
                false
            }
            Err(_) => {
                warn!("Cache set timed out for {}", key);
                false
            }
        }
    }

    pub async fn get_dividends(&self, netuid: i32, hotkey: &str) -> Option<DividendSnapshot> {
        self.get_json(&Self::dividend_key(netuid, hotkey)).await
    }

    pub async fn set_dividends(&self, snapshot: &DividendSnapshot, ttl: Option<Duration>) -> bool {
        let key = Self::dividend_key(snapshot.netuid, &snapshot.hotkey);
        self.set_json(&key, snapshot, ttl).await
    }
}

/// Short-lived per-task status entries, kept under `task_status:{id}`.
#[derive(Clone)]
pub struct TaskStatusBoard {
    cache: CacheLayer,
    ttl: Duration,
}

impl TaskStatusBoard {
    pub fn new(cache: CacheLayer, ttl: Duration) -> Self {
        TaskStatusBoard { cache, ttl }
    }

    fn key(task_id: &str) -> String {
        format!("task_status:{}", task_id)
    }

    pub async fn publish(&self, task_id: &str, status: TaskStatus, message: Option<String>) -> bool {
        let entry = LiveTaskStatus {
            task_id: task_id.to_string(),
            status,
            updated_at: Utc::now(),
            message,
        };
        self.cache.set_json(&Self::key(task_id), &entry, Some(self.ttl)).await
    }

    pub async fn lookup(&self, task_id: &str) -> Option<LiveTaskStatus> {
        self.cache.get_json(&Self::key(task_id)).await
    }
}
