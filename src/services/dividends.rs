// src/services/dividends.rs
use anyhow::Result;
use log::{info, warn};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::{DividendQueryResponse, DividendSnapshot};
use crate::services::cache::CacheLayer;
use crate::services::chain::ChainClient;
use crate::services::history::HistoryRecorder;
use crate::services::orchestrator::TaskQueue;

pub const MAX_TRADE_AMOUNT: f64 = 10.0;
pub const TRADE_BALANCE_FRACTION: f64 = 0.10;

/// Size of the trade queued for a trade-flagged query.
pub fn default_trade_amount(balance: f64) -> f64 {
    MAX_TRADE_AMOUNT.min(balance * TRADE_BALANCE_FRACTION).max(0.0)
}

/// Serves dividend queries: cache first, then at most one fresh chain fetch
/// per key at a time, then the audit record.
pub struct DividendService {
    chain: Arc<ChainClient>,
    cache: CacheLayer,
    recorder: HistoryRecorder,
    queue: TaskQueue,
    fetch_gates: Cache<String, Arc<Mutex<()>>>,
    default_netuid: i32,
    default_hotkey: String,
}

impl DividendService {
    pub fn new(
        chain: Arc<ChainClient>,
        cache: CacheLayer,
        recorder: HistoryRecorder,
        queue: TaskQueue,
        default_netuid: i32,
        default_hotkey: impl Into<String>,
    ) -> Self {
        let fetch_gates = Cache::builder()
            .time_to_idle(Duration::from_secs(300))
            .build();
        DividendService {
            chain,
            cache,
            recorder,
            queue,
            fetch_gates,
            default_netuid,
            default_hotkey: default_hotkey.into(),
        }
    }

    /// Answers one query. Only a failure to queue a requested trade is an error.
    pub async fn query(&self, netuid: Option<i32>, hotkey: Option<String>, trade: bool) -> Result<DividendQueryResponse> {
        let netuid = netuid.unwrap_or(self.default_netuid);
        let hotkey = hotkey
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| self.default_hotkey.clone());
        let query_id = uuid::Uuid::new_v4().to_string();

        if trade {
            return self.query_and_trade(&query_id, netuid, &hotkey).await;
        }

        if let Some(snapshot) = self.cached(netuid, &hotkey).await {
            info!("Cache hit for {}:{}", netuid, hotkey);
            self.recorder.record(&query_id, netuid, &hotkey, &snapshot, true).await;
            return Ok(untraded(snapshot));
        }

        let (snapshot, was_cached) = self.fetch_once(netuid, &hotkey).await;
        self.recorder.record(&query_id, netuid, &hotkey, &snapshot, was_cached).await;
        Ok(untraded(snapshot))
    }

    async fn cached(&self, netuid: i32, hotkey: &str) -> Option<DividendSnapshot> {
        let mut snapshot = self.cache.get_dividends(netuid, hotkey).await?;
        snapshot.from_cache = true;
        Some(snapshot)
    }

    /// Concurrent misses on one key wait for the first fetch and then read
    /// its cached result instead of going to the chain again.
    async fn fetch_once(&self, netuid: i32, hotkey: &str) -> (DividendSnapshot, bool) {
        let key = CacheLayer::dividend_key(netuid, hotkey);
        let gate = self
            .fetch_gates
            .get_with(key, async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = gate.lock().await;

        if let Some(snapshot) = self.cached(netuid, hotkey).await {
            return (snapshot, true);
        }

        info!("Cache miss for {}:{}, fetching from chain", netuid, hotkey);
        let snapshot = self.chain.fetch_dividends(netuid, hotkey).await;
        if snapshot.is_degraded() {
            warn!("Not caching degraded snapshot for {}:{}", netuid, hotkey);
        } else {
            self.cache.set_dividends(&snapshot, None).await;
        }
        (snapshot, false)
    }

    async fn query_and_trade(&self, query_id: &str, netuid: i32, hotkey: &str) -> Result<DividendQueryResponse> {
        let snapshot = self.chain.fetch_dividends(netuid, hotkey).await;
        self.recorder.record(query_id, netuid, hotkey, &snapshot, false).await;

        let amount = default_trade_amount(snapshot.balance);
        let task_id = self.queue.submit(netuid, hotkey, amount).await?;
        info!("Trade requested for {}:{}, task {} (amount {})", netuid, hotkey, task_id, amount);

        Ok(DividendQueryResponse {
            snapshot,
            stake_tx_triggered: true,
            task_id: Some(task_id),
        })
    }
}

fn untraded(snapshot: DividendSnapshot) -> DividendQueryResponse {
    DividendQueryResponse {
        snapshot,
        stake_tx_triggered: false,
        task_id: None,
    }
}
