// src/services/history.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{DividendSnapshot, QueryHistoryRecord, SentimentTask, TaskHistoryRecord, TaskStatus};

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(skip: Option<u32>, limit: Option<u32>) -> Self {
        Page {
            skip: skip.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new(None, None)
    }
}

/// Durable record of served queries and task outcomes. Listings are
/// newest first.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_query(&self, record: &QueryHistoryRecord) -> Result<()>;
    async fn list_queries(&self, page: Page) -> Result<Vec<QueryHistoryRecord>>;
    /// Inserts or overwrites the row for `task.task_id`. `created_at` of an
    /// existing row is preserved.
    async fn upsert_task(&self, task: &SentimentTask) -> Result<()>;
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskHistoryRecord>>;
    async fn list_tasks(&self, page: Page, status: Option<TaskStatus>) -> Result<Vec<TaskHistoryRecord>>;
}

#[derive(Default)]
struct MemoryTables {
    next_id: i64,
    queries: Vec<QueryHistoryRecord>,
    tasks: Vec<TaskHistoryRecord>,
}

impl MemoryTables {
    fn mint_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryHistoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    rows.skip(page.skip as usize).take(page.limit as usize).collect()
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert_query(&self, record: &QueryHistoryRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.queries.iter().any(|q| q.query_id == record.query_id) {
            anyhow::bail!("duplicate query_id {}", record.query_id);
        }
        let mut row = record.clone();
        row.id = tables.mint_id();
        tables.queries.push(row);
        Ok(())
    }

    async fn list_queries(&self, page: Page) -> Result<Vec<QueryHistoryRecord>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&QueryHistoryRecord> = tables.queries.iter().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(rows.into_iter().cloned(), page))
    }

    async fn upsert_task(&self, task: &SentimentTask) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.tasks.iter_mut().find(|t| t.task.task_id == task.task_id) {
            let created_at = existing.task.created_at;
            existing.task = task.clone();
            existing.task.created_at = created_at;
            return Ok(());
        }
        let id = tables.mint_id();
        tables.tasks.push(TaskHistoryRecord { id, task: task.clone() });
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskHistoryRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.iter().find(|t| t.task.task_id == task_id).cloned())
    }

    async fn list_tasks(&self, page: Page, status: Option<TaskStatus>) -> Result<Vec<TaskHistoryRecord>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<&TaskHistoryRecord> = tables
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.task.status == s))
            .collect();
        rows.sort_by(|a, b| b.task.created_at.cmp(&a.task.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(rows.into_iter().cloned(), page))
    }
}

/// Appends one audit row per served dividend query. Failures are logged
/// and never reach the response path.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        HistoryRecorder { store }
    }

    pub async fn record(&self, query_id: &str, netuid: i32, hotkey: &str, snapshot: &DividendSnapshot, was_cached: bool) {
        let record = QueryHistoryRecord {
            id: 0,
            query_id: query_id.to_string(),
            netuid,
            hotkey: hotkey.to_string(),
            dividends: snapshot.dividends,
            stake: snapshot.stake,
            balance: snapshot.balance,
            cached: was_cached,
            created_at: Utc::now(),
        };

        match self.store.insert_query(&record).await {
            Ok(()) => info!("Recorded {} query {} for {}:{}", if was_cached { "cached" } else { "fresh" }, query_id, netuid, hotkey),
            Err(e) => error!("Failed to record query {} for {}:{}: {}", query_id, netuid, hotkey, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;

    fn snapshot(dividends: f64) -> DividendSnapshot {
        DividendSnapshot::fresh(18, "hk", dividends, 2.0, 3.0, true)
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_paginated() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = HistoryRecorder::new(store.clone());
        for i in 0..15 {
            recorder.record(&format!("q{}", i), 18, "hk", &snapshot(i as f64), false).await;
        }

        let first = store.list_queries(Page::new(Some(0), Some(10))).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].query_id, "q14");
        assert_eq!(first[9].query_id, "q5");

        let rest = store.list_queries(Page::new(Some(10), Some(10))).await.unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[4].query_id, "q0");
    }

    #[test]
    fn test_page_limit_is_capped() {
        assert_eq!(Page::new(None, Some(50_000)).limit, MAX_PAGE_LIMIT);
        assert_eq!(Page::default(), Page { skip: 0, limit: DEFAULT_PAGE_LIMIT });
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_with_latest_fields() {
        let store = MemoryHistoryStore::new();
        let mut task = SentimentTask::new(18, "hk", 4.0);
        store.upsert_task(&task).await.unwrap();

        task.advance(TaskStatus::Processing).unwrap();
        task.advance(TaskStatus::AnalyzingSentiment).unwrap();
        task.sentiment_score = Some(0.5);
        task.action = Some(TradeAction::Stake);
        store.upsert_task(&task).await.unwrap();

        let rows = store.list_tasks(Page::default(), None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task, task);
        assert_eq!(store.get_task(&task.task_id).await.unwrap().unwrap().id, rows[0].id);
    }

    #[tokio::test]
    async fn test_task_listing_filters_by_status() {
        let store = MemoryHistoryStore::new();
        let done = {
            let mut t = SentimentTask::new(1, "a", 1.0);
            t.fail("boom").unwrap();
            t
        };
        store.upsert_task(&done).await.unwrap();
        store.upsert_task(&SentimentTask::new(2, "b", 1.0)).await.unwrap();

        let failed = store.list_tasks(Page::default(), Some(TaskStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task.task_id, done.task_id);
        assert_eq!(store.list_tasks(Page::default(), None).await.unwrap().len(), 2);
    }

    struct DownStore;

    #[async_trait]
    impl HistoryStore for DownStore {
        async fn insert_query(&self, _record: &QueryHistoryRecord) -> Result<()> {
            anyhow::bail!("connection pool timed out")
        }
        async fn list_queries(&self, _page: Page) -> Result<Vec<QueryHistoryRecord>> {
            anyhow::bail!("down")
        }
        async fn upsert_task(&self, _task: &SentimentTask) -> Result<()> {
            anyhow::bail!("down")
        }
        async fn get_task(&self, _task_id: &str) -> Result<Option<TaskHistoryRecord>> {
            anyhow::bail!("down")
        }
        async fn list_tasks(&self, _page: Page, _status: Option<TaskStatus>) -> Result<Vec<TaskHistoryRecord>> {
            anyhow::bail!("down")
        }
    }

    #[tokio::test]
    async fn test_recorder_swallows_store_failure() {
        let recorder = HistoryRecorder::new(Arc::new(DownStore));
        recorder.record("q", 18, "hk", &snapshot(1.0), true).await;
    }
}
