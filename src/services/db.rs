// src/services/db.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::models::{QueryHistoryRecord, SentimentTask, TaskHistoryRecord, TaskStatus, TradeAction};
use crate::services::history::{HistoryStore, Page};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS dividend_query_history (
        id BIGSERIAL PRIMARY KEY,
        query_id VARCHAR(36) NOT NULL UNIQUE,
        netuid INTEGER NOT NULL,
        hotkey VARCHAR(255) NOT NULL,
        dividends DOUBLE PRECISION NOT NULL DEFAULT 0,
        stake DOUBLE PRECISION NOT NULL DEFAULT 0,
        balance DOUBLE PRECISION NOT NULL DEFAULT 0,
        cached BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dividend_query_created ON dividend_query_history (created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS sentiment_task_history (
        id BIGSERIAL PRIMARY KEY,
        task_id VARCHAR(36) NOT NULL UNIQUE,
        netuid INTEGER NOT NULL,
        hotkey VARCHAR(255) NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        sentiment_score DOUBLE PRECISION,
        action VARCHAR(20),
        status VARCHAR(32) NOT NULL DEFAULT 'PENDING',
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sentiment_task_created ON sentiment_task_history (created_at DESC)",
];

pub struct PgHistoryStore {
    pub(crate) pool: PgPool,
}

impl PgHistoryStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply schema statement: {}", statement.trim()))?;
        }
        info!("History schema ready");
        Ok(())
    }
}

fn query_from_row(row: &PgRow) -> Result<QueryHistoryRecord> {
    Ok(QueryHistoryRecord {
        id: row.try_get("id")?,
        query_id: row.try_get("query_id")?,
        netuid: row.try_get("netuid")?,
        hotkey: row.try_get("hotkey")?,
        dividends: row.try_get("dividends")?,
        stake: row.try_get("stake")?,
        balance: row.try_get("balance")?,
        cached: row.try_get("cached")?,
        created_at: row.try_get("created_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<TaskHistoryRecord> {
    let status: String = row.try_get("status")?;
    let action: Option<String> = row.try_get("action")?;
    Ok(TaskHistoryRecord {
        id: row.try_get("id")?,
        task: SentimentTask {
            task_id: row.try_get("task_id")?,
            netuid: row.try_get("netuid")?,
            hotkey: row.try_get("hotkey")?,
            amount: row.try_get("amount")?,
            sentiment_score: row.try_get("sentiment_score")?,
            action: action
                .map(|a| a.parse::<TradeAction>())
                .transpose()
                .map_err(anyhow::Error::msg)?,
            status: status.parse::<TaskStatus>().map_err(anyhow::Error::msg)?,
            error_note: row.try_get("error")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            completed_at: row.try_get("completed_at")?,
        },
    })
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn insert_query(&self, record: &QueryHistoryRecord) -> Result<()> {
        // Dropping an uncommitted transaction rolls it back.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO dividend_query_history
                (query_id, netuid, hotkey, dividends, stake, balance, cached, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.query_id)
        .bind(record.netuid)
        .bind(&record.hotkey)
        .bind(record.dividends)
        .bind(record.stake)
        .bind(record.balance)
        .bind(record.cached)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_queries(&self, page: Page) -> Result<Vec<QueryHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, query_id, netuid, hotkey, dividends, stake, balance, cached, created_at
            FROM dividend_query_history
            ORDER BY created_at DESC, id DESC
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(i64::from(page.skip))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(query_from_row).collect()
    }

    async fn upsert_task(&self, task: &SentimentTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sentiment_task_history
                (task_id, netuid, hotkey, amount, sentiment_score, action, status, error, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (task_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                sentiment_score = EXCLUDED.sentiment_score,
                action = EXCLUDED.action,
                status = EXCLUDED.status,
                error = EXCLUDED.error,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&task.task_id)
        .bind(task.netuid)
        .bind(&task.hotkey)
        .bind(task.amount)
        .bind(task.sentiment_score)
        .bind(task.action.map(|a| a.as_str()))
        .bind(task.status.as_str())
        .bind(task.error_note.as_deref())
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskHistoryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, netuid, hotkey, amount, sentiment_score, action, status, error, created_at, completed_at
            FROM sentiment_task_history
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, page: Page, status: Option<TaskStatus>) -> Result<Vec<TaskHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, netuid, hotkey, amount, sentiment_score, action, status, error, created_at, completed_at
            FROM sentiment_task_history
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(page.skip))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }
}
