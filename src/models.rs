// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sentiment above this value stakes; anything at or below it unstakes.
pub const STAKE_THRESHOLD: f64 = 0.2;

/// Dividend, stake and balance figures for one (netuid, hotkey) pair.
///
/// A snapshot is either fully populated from the chain or carries an
/// `error_note` with every financial field zeroed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendSnapshot {
    pub netuid: i32,
    pub hotkey: String,
    pub dividends: f64,
    pub stake: f64,
    pub balance: f64,
    pub is_registered: bool,
    #[serde(rename = "cached", default)]
    pub from_cache: bool,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_note: Option<String>,
}

impl DividendSnapshot {
    pub fn fresh(netuid: i32, hotkey: &str, dividends: f64, stake: f64, balance: f64, is_registered: bool) -> Self {
        DividendSnapshot {
            netuid,
            hotkey: hotkey.to_string(),
            dividends: non_negative(dividends),
            stake: non_negative(stake),
            balance: non_negative(balance),
            is_registered,
            from_cache: false,
            error_note: None,
        }
    }

    pub fn unavailable(netuid: i32, hotkey: &str, note: impl Into<String>) -> Self {
        DividendSnapshot {
            netuid,
            hotkey: hotkey.to_string(),
            dividends: 0.0,
            stake: 0.0,
            balance: 0.0,
            is_registered: false,
            from_cache: false,
            error_note: Some(note.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error_note.is_some()
    }
}

/// Clamps chain figures into the non-negative range; NaN becomes zero.
pub fn non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Stake,
    Unstake,
}

impl TradeAction {
    pub fn decide(sentiment_score: f64) -> Self {
        if sentiment_score > STAKE_THRESHOLD {
            TradeAction::Stake
        } else {
            TradeAction::Unstake
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Stake => "STAKE",
            TradeAction::Unstake => "UNSTAKE",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STAKE" => Ok(TradeAction::Stake),
            "UNSTAKE" => Ok(TradeAction::Unstake),
            other => Err(format!("unknown trade action: {}", other)),
        }
    }
}

/// Lifecycle of a sentiment task. Variants are declared in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    AnalyzingSentiment,
    ConnectingBlockchain,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::AnalyzingSentiment => "ANALYZING_SENTIMENT",
            TaskStatus::ConnectingBlockchain => "CONNECTING_BLOCKCHAIN",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The single status that may follow this one on the success path.
    fn successor(&self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Pending => Some(TaskStatus::Processing),
            TaskStatus::Processing => Some(TaskStatus::AnalyzingSentiment),
            TaskStatus::AnalyzingSentiment => Some(TaskStatus::ConnectingBlockchain),
            TaskStatus::ConnectingBlockchain => Some(TaskStatus::Completed),
            TaskStatus::Completed | TaskStatus::Failed => None,
        }
    }

    /// Forward by exactly one step, or to FAILED from any non-terminal status.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == TaskStatus::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "ANALYZING_SENTIMENT" => Ok(TaskStatus::AnalyzingSentiment),
            "CONNECTING_BLOCKCHAIN" => Ok(TaskStatus::ConnectingBlockchain),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One sentiment-driven trade request as it moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentTask {
    pub task_id: String,
    pub netuid: i32,
    pub hotkey: String,
    pub amount: f64,
    pub sentiment_score: Option<f64>,
    pub action: Option<TradeAction>,
    pub status: TaskStatus,
    #[serde(rename = "error")]
    pub error_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SentimentTask {
    pub fn new(netuid: i32, hotkey: &str, amount: f64) -> Self {
        SentimentTask {
            task_id: uuid::Uuid::new_v4().to_string(),
            netuid,
            hotkey: hotkey.to_string(),
            amount: non_negative(amount),
            sentiment_score: None,
            action: None,
            status: TaskStatus::Pending,
            error_note: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError { from: self.status, to: next });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&mut self, note: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Failed)?;
        self.error_note = Some(note.into());
        Ok(())
    }
}

/// Outcome of a stake or unstake request. `success == false` is a normal
/// business result, not a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub new_stake: Option<f64>,
    pub tx_ref: Option<String>,
}

impl ActionResult {
    pub fn succeeded(message: impl Into<String>, new_stake: Option<f64>, tx_ref: Option<String>) -> Self {
        ActionResult {
            success: true,
            message: message.into(),
            new_stake: new_stake.map(non_negative),
            tx_ref,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionResult {
            success: false,
            message: message.into(),
            new_stake: None,
            tx_ref: None,
        }
    }
}

/// Append-only audit row for a served dividend query. `id` is assigned by
/// the store and is zero until persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHistoryRecord {
    pub id: i64,
    pub query_id: String,
    pub netuid: i32,
    pub hotkey: String,
    pub dividends: f64,
    pub stake: f64,
    pub balance: f64,
    pub cached: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable view of a task, keyed by `task.task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    pub id: i64,
    #[serde(flatten)]
    pub task: SentimentTask,
}

/// Entry on the short-lived status board read by the task status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTaskStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DividendQueryResponse {
    #[serde(flatten)]
    pub snapshot: DividendSnapshot,
    pub stake_tx_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResultPayload {
    pub netuid: i32,
    pub hotkey: String,
    pub amount: f64,
    pub sentiment_score: Option<f64>,
    pub action: Option<TradeAction>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&SentimentTask> for TaskResultPayload {
    fn from(task: &SentimentTask) -> Self {
        TaskResultPayload {
            netuid: task.netuid,
            hotkey: task.hotkey.clone(),
            amount: task.amount,
            sentiment_score: task.sentiment_score,
            action: task.action,
            error: task.error_note.clone(),
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_threshold_is_exclusive() {
        assert_eq!(TradeAction::decide(0.2), TradeAction::Unstake);
        assert_eq!(TradeAction::decide(0.2000001), TradeAction::Stake);
        assert_eq!(TradeAction::decide(-1.0), TradeAction::Unstake);
        assert_eq!(TradeAction::decide(1.0), TradeAction::Stake);
    }

    #[test]
    fn test_task_walks_forward_only() {
        let mut task = SentimentTask::new(18, "hk", 1.0);
        assert!(task.advance(TaskStatus::AnalyzingSentiment).is_err());
        task.advance(TaskStatus::Processing).unwrap();
        task.advance(TaskStatus::AnalyzingSentiment).unwrap();
        assert_eq!(
            task.advance(TaskStatus::Processing),
            Err(TransitionError { from: TaskStatus::AnalyzingSentiment, to: TaskStatus::Processing })
        );
        task.advance(TaskStatus::ConnectingBlockchain).unwrap();
        task.advance(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.advance(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_failed_reachable_from_any_open_status() {
        for start in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::AnalyzingSentiment,
            TaskStatus::ConnectingBlockchain,
        ] {
            assert!(start.can_advance_to(TaskStatus::Failed), "{} -> FAILED", start);
        }
        assert!(!TaskStatus::Failed.can_advance_to(TaskStatus::Failed));
    }

    #[test]
    fn test_fail_sets_note() {
        let mut task = SentimentTask::new(1, "hk", 2.0);
        task.fail("Insufficient balance: 1 < 2").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_note.as_deref(), Some("Insufficient balance: 1 < 2"));
    }

    #[test]
    fn test_status_wire_names_round_trip() {
        let json = serde_json::to_string(&TaskStatus::AnalyzingSentiment).unwrap();
        assert_eq!(json, "\"ANALYZING_SENTIMENT\"");
        assert_eq!("connecting_blockchain".parse::<TaskStatus>(), Ok(TaskStatus::ConnectingBlockchain));
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_snapshot_serializes_cached_flag() {
        let mut snap = DividendSnapshot::fresh(18, "hk", 1.5, -3.0, 10.0, true);
        assert_eq!(snap.stake, 0.0);
        snap.from_cache = true;
        let value = serde_json::to_value(&snap).unwrap();
        assert_eq!(value["cached"], true);
        assert!(value.get("error").is_none());

        let degraded = DividendSnapshot::unavailable(18, "hk", "boom");
        assert!(degraded.is_degraded());
        assert_eq!(serde_json::to_value(&degraded).unwrap()["error"], "boom");
    }
}
