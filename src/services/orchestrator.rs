// src/services/orchestrator.rs
use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::models::{
    ActionResult, SentimentTask, TaskResultPayload, TaskStatus, TaskStatusResponse, TradeAction,
};
use crate::services::cache::TaskStatusBoard;
use crate::services::chain::ChainClient;
use crate::services::history::HistoryStore;
use crate::services::sentiment::SentimentEngine;

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: SentimentTask,
    pub result: ActionResult,
}

/// Drives one task from PROCESSING to COMPLETED or FAILED. It is the only
/// writer of task state; every transition is written to the status board
/// and upserted into the history store before the next step starts.
pub struct TaskOrchestrator {
    chain: Arc<ChainClient>,
    sentiment: Arc<SentimentEngine>,
    board: TaskStatusBoard,
    store: Arc<dyn HistoryStore>,
}

impl TaskOrchestrator {
    pub fn new(
        chain: Arc<ChainClient>,
        sentiment: Arc<SentimentEngine>,
        board: TaskStatusBoard,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        TaskOrchestrator { chain, sentiment, board, store }
    }

    /// Runs the pipeline. On failure the task is left FAILED with the
    /// cause as its error note, and the error is returned to the worker.
    pub async fn execute(&self, mut task: SentimentTask) -> Result<TaskOutcome> {
        match self.run_pipeline(&mut task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if task.status != TaskStatus::Failed {
                    let note = format!("{:#}", e);
                    if let Err(transition) = task.fail(note.clone()) {
                        warn!("Task {} could not be marked failed: {}", task.task_id, transition);
                    }
                    self.persist(&task, Some(format!("Task failed: {}", note))).await;
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, task: &mut SentimentTask) -> Result<TaskOutcome> {
        let netuid = task.netuid;

        self.advance(task, TaskStatus::Processing, format!("Processing sentiment analysis for netuid {}", netuid))
            .await?;
        self.advance(task, TaskStatus::AnalyzingSentiment, "Analyzing subnet sentiment".to_string())
            .await?;

        let score = self.sentiment.score_subnet(netuid).await;
        task.sentiment_score = Some(score);
        // Observers may see the score before the action is decided.
        self.persist(task, Some(format!("Sentiment score {:.2}", score))).await;

        let action = TradeAction::decide(score);
        task.action = Some(action);
        self.advance(task, TaskStatus::ConnectingBlockchain, format!("Connecting to blockchain to {}", action))
            .await?;

        let result = match action {
            TradeAction::Stake => self.chain.stake(netuid, &task.hotkey, task.amount).await,
            TradeAction::Unstake => self.chain.unstake(netuid, &task.hotkey, task.amount).await,
        };

        if result.success {
            self.advance(task, TaskStatus::Completed, result.message.clone()).await?;
            Ok(TaskOutcome { task: task.clone(), result })
        } else {
            task.fail(result.message.clone())?;
            self.persist(task, Some(result.message.clone())).await;
            Err(anyhow!("{} {} failed: {}", action, task.task_id, result.message))
        }
    }

    async fn advance(&self, task: &mut SentimentTask, next: TaskStatus, message: String) -> Result<()> {
        task.advance(next)
            .with_context(|| format!("task {}", task.task_id))?;
        info!("Task {} -> {}", task.task_id, next);
        self.persist(task, Some(message)).await;
        Ok(())
    }

    /// Marks a task whose pipeline died mid-flight as FAILED. Starts from the
    /// latest durable record so fields written before the abort survive; a
    /// record that is already terminal is left alone.
    async fn fail_aborted(&self, dispatched: SentimentTask, note: String) {
        let mut task = match self.store.get_task(&dispatched.task_id).await {
            Ok(Some(record)) => record.task,
            Ok(None) => dispatched,
            Err(e) => {
                warn!("Could not reload task {} after abort: {}", dispatched.task_id, e);
                dispatched
            }
        };
        if task.status.is_terminal() {
            warn!("Task {} already {}, keeping its record", task.task_id, task.status);
            return;
        }
        if task.fail(note).is_ok() {
            self.persist(&task, task.error_note.clone()).await;
        }
    }

    /// Best-effort write to both stores, durable record first so a terminal
    /// status on the board always has its result behind it. Failures are
    /// logged and swallowed.
    async fn persist(&self, task: &SentimentTask, message: Option<String>) {
        if let Err(e) = self.store.upsert_task(task).await {
            error!("Error recording task {} status {}: {}", task.task_id, task.status, e);
        }
        if !self.board.publish(&task.task_id, task.status, message).await {
            warn!("Live status for task {} not updated", task.task_id);
        }
    }
}

/// Accepts new tasks and answers status lookups. Cloning is cheap.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<SentimentTask>,
    board: TaskStatusBoard,
    store: Arc<dyn HistoryStore>,
}

impl TaskQueue {
    /// Mints a task, records it as PENDING and hands it to the worker
    /// without waiting for it to run.
    pub async fn submit(&self, netuid: i32, hotkey: &str, amount: f64) -> Result<String> {
        let task = SentimentTask::new(netuid, hotkey, amount);
        let task_id = task.task_id.clone();

        if let Err(e) = self.store.upsert_task(&task).await {
            error!("Error recording new task {}: {}", task_id, e);
        }
        self.board
            .publish(&task_id, TaskStatus::Pending, Some("Task is waiting to be processed".to_string()))
            .await;

        self.sender
            .send(task)
            .map_err(|_| anyhow!("task worker is not running"))?;
        info!("Queued task {} (netuid={}, hotkey={}, amount={})", task_id, netuid, hotkey, amount);
        Ok(task_id)
    }

    /// Never fails: an id that is not visible yet reads as PENDING.
    pub async fn status(&self, task_id: &str) -> TaskStatusResponse {
        let live = self.board.lookup(task_id).await;
        let stored = match self.store.get_task(task_id).await {
            Ok(record) => record.map(|r| r.task),
            Err(e) => {
                warn!("Task store lookup failed for {}: {}", task_id, e);
                None
            }
        };

        if let Some(live) = live {
            let result = stored
                .as_ref()
                .filter(|_| live.status.is_terminal())
                .map(TaskResultPayload::from);
            return TaskStatusResponse {
                task_id: task_id.to_string(),
                status: live.status,
                updated_at: Some(live.updated_at),
                message: live.message,
                result,
            };
        }

        match stored {
            Some(task) => TaskStatusResponse {
                task_id: task_id.to_string(),
                status: task.status,
                updated_at: task.completed_at.or(Some(task.created_at)),
                message: task.error_note.clone(),
                result: task.status.is_terminal().then(|| TaskResultPayload::from(&task)),
            },
            None => TaskStatusResponse {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
                updated_at: None,
                message: Some("Task is waiting to be processed".to_string()),
                result: None,
            },
        }
    }
}

/// Starts the background consumer and returns the producer handle.
/// At most `concurrency` tasks run at once.
pub fn spawn_worker(
    orchestrator: Arc<TaskOrchestrator>,
    board: TaskStatusBoard,
    store: Arc<dyn HistoryStore>,
    concurrency: usize,
) -> (TaskQueue, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let queue = TaskQueue { sender, board, store };
    let handle = tokio::spawn(run_worker(orchestrator, receiver, concurrency.max(1)));
    (queue, handle)
}

async fn run_worker(
    orchestrator: Arc<TaskOrchestrator>,
    mut receiver: mpsc::UnboundedReceiver<SentimentTask>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    info!("Task worker started (concurrency={})", concurrency);

    while let Some(task) = receiver.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let task_id = task.task_id.clone();
            let job = {
                let orchestrator = orchestrator.clone();
                let task = task.clone();
                tokio::spawn(async move { orchestrator.execute(task).await })
            };
            match job.await {
                Ok(Ok(outcome)) => info!("Task {} completed: {}", task_id, outcome.result.message),
                Ok(Err(e)) => error!("Task {} failed: {:#}", task_id, e),
                Err(join_error) => {
                    error!("Task {} aborted: {}", task_id, join_error);
                    orchestrator
                        .fail_aborted(task, format!("Task failed: {}", join_error))
                        .await;
                }
            }
            drop(permit);
        });
    }

    info!("Task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LiveTaskStatus;
    use crate::services::cache::{CacheLayer, MemoryStore};
    use crate::services::chain::{ChainBackend, ChainConnector, ChainError, NeuronInfo, RetryPolicy, Submission};
    use crate::services::history::{MemoryHistoryStore, Page};
    use crate::testing::{CannedScorer, CannedSearch, FakeConnector, FakeLedger, COLDKEY};
    use std::time::Duration;

    struct Harness {
        ledger: Arc<FakeLedger>,
        board: TaskStatusBoard,
        store: Arc<MemoryHistoryStore>,
        orchestrator: Arc<TaskOrchestrator>,
    }

    fn harness(reply: &str) -> Harness {
        let ledger = Arc::new(FakeLedger::new());
        let chain = ChainClient::new(Arc::new(FakeConnector::new(ledger.clone())), COLDKEY, Duration::from_secs(2))
            .with_retry(RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1) });
        let sentiment = SentimentEngine::new(
            Arc::new(CannedSearch::snippets(&["subnet chatter"])),
            Arc::new(CannedScorer::replying(reply)),
        );
        let cache = CacheLayer::new(Arc::new(MemoryStore::new(100)), Duration::from_secs(60));
        let board = TaskStatusBoard::new(cache, Duration::from_secs(60));
        let store = Arc::new(MemoryHistoryStore::new());
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::new(chain),
            Arc::new(sentiment),
            board.clone(),
            store.clone(),
        ));
        Harness { ledger, board, store, orchestrator }
    }

    #[tokio::test]
    async fn test_positive_sentiment_stakes() {
        let h = harness("80");
        h.ledger.fund(COLDKEY, 50.0).await;
        let task = SentimentTask::new(18, "hk", 5.0);

        let outcome = h.orchestrator.execute(task.clone()).await.unwrap();
        assert_eq!(outcome.task.status, TaskStatus::Completed);
        assert_eq!(outcome.task.action, Some(TradeAction::Stake));
        assert_eq!(outcome.task.sentiment_score, Some(0.8));
        assert!(outcome.task.completed_at.is_some());

        let stored = h.store.get_task(&task.task_id).await.unwrap().unwrap().task;
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.action, Some(TradeAction::Stake));
        assert_eq!(h.board.lookup(&task.task_id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_threshold_score_unstakes() {
        let h = harness("20");
        h.ledger.register("hk", 18, 10.0, 0.0).await;
        let outcome = h.orchestrator.execute(SentimentTask::new(18, "hk", 2.0)).await.unwrap();
        assert_eq!(outcome.task.action, Some(TradeAction::Unstake));
        assert_eq!(outcome.result.new_stake, Some(8.0));
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_task() {
        let h = harness("95");
        h.ledger.fund(COLDKEY, 1.0).await;
        let task = SentimentTask::new(18, "hk", 5.0);

        let err = h.orchestrator.execute(task.clone()).await.unwrap_err();
        assert!(err.to_string().to_lowercase().contains("insufficient"));

        let stored = h.store.get_task(&task.task_id).await.unwrap().unwrap().task;
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.sentiment_score, Some(0.95));
        assert_eq!(stored.action, Some(TradeAction::Stake));
        assert!(stored.error_note.unwrap().to_lowercase().contains("insufficient"));
        assert_eq!(h.store.list_tasks(Page::default(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_sentiment_still_decides() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.register("hk", 3, 10.0, 0.0).await;
        let chain = ChainClient::new(Arc::new(FakeConnector::new(ledger)), COLDKEY, Duration::from_secs(2));
        let sentiment = SentimentEngine::new(
            Arc::new(CannedSearch::failing("dns")),
            Arc::new(CannedScorer::failing("500")),
        );
        let cache = CacheLayer::new(Arc::new(MemoryStore::new(10)), Duration::from_secs(60));
        let board = TaskStatusBoard::new(cache, Duration::from_secs(60));
        let store = Arc::new(MemoryHistoryStore::new());
        let orchestrator = TaskOrchestrator::new(Arc::new(chain), Arc::new(sentiment), board, store);

        let outcome = orchestrator.execute(SentimentTask::new(3, "hk", 1.0)).await.unwrap();
        assert_eq!(outcome.task.sentiment_score, Some(0.0));
        assert_eq!(outcome.task.action, Some(TradeAction::Unstake));
    }

    #[tokio::test]
    async fn test_task_that_already_ran_is_not_rerun() {
        let h = harness("80");
        h.ledger.fund(COLDKEY, 50.0).await;
        let mut task = SentimentTask::new(18, "hk", 5.0);
        task.fail("cancelled upstream").unwrap();
        h.store.upsert_task(&task).await.unwrap();

        let err = h.orchestrator.execute(task.clone()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("illegal task transition"));
        assert_eq!(h.ledger.submissions().await, 0);
        let stored = h.store.get_task(&task.task_id).await.unwrap().unwrap().task;
        assert_eq!(stored.error_note.as_deref(), Some("cancelled upstream"));
    }

    async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> TaskStatusResponse {
        for _ in 0..200 {
            let status = queue.status(task_id).await;
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    #[tokio::test]
    async fn test_worker_runs_submitted_task() {
        let h = harness("60");
        h.ledger.fund(COLDKEY, 50.0).await;
        let (queue, _worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), h.store.clone(), 2);

        let task_id = queue.submit(18, "hk", 3.0).await.unwrap();
        assert!(!task_id.is_empty());

        let status = wait_for_terminal(&queue, &task_id).await;
        assert_eq!(status.status, TaskStatus::Completed);
        let result = status.result.unwrap();
        assert_eq!(result.action, Some(TradeAction::Stake));
        assert_eq!(result.sentiment_score, Some(0.6));
        assert_eq!(h.ledger.balance_of(COLDKEY).await, 47.0);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let h = harness("60");
        h.ledger.fund(COLDKEY, 50.0).await;
        let (queue, _worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), h.store.clone(), 1);
        let task_id = queue.submit(18, "hk", 1.0).await.unwrap();

        let mut last = TaskStatus::Pending;
        for _ in 0..200 {
            let seen = queue.status(&task_id).await.status;
            assert!(seen >= last, "status went from {} back to {}", last, seen);
            last = seen;
            if seen.is_terminal() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(wait_for_terminal(&queue, &task_id).await.status, TaskStatus::Completed);
    }

    struct PanickingLedger {
        inner: Arc<FakeLedger>,
    }

    #[async_trait::async_trait]
    impl ChainBackend for PanickingLedger {
        async fn get_block_hash(&self) -> Result<String, ChainError> {
            self.inner.get_block_hash().await
        }
        async fn get_neuron(&self, hotkey: &str, netuid: i32, block_hash: Option<&str>) -> Result<Option<NeuronInfo>, ChainError> {
            self.inner.get_neuron(hotkey, netuid, block_hash).await
        }
        async fn get_dividends(&self, netuid: i32, hotkey: &str, block_hash: &str) -> Result<f64, ChainError> {
            self.inner.get_dividends(netuid, hotkey, block_hash).await
        }
        async fn get_balance(&self, address: &str, block_hash: Option<&str>) -> Result<f64, ChainError> {
            self.inner.get_balance(address, block_hash).await
        }
        async fn submit_stake(&self, _wallet: &str, _hotkey: &str, _netuid: i32, _amount: f64) -> Result<Submission, ChainError> {
            panic!("node client crashed mid-submit");
        }
        async fn submit_unstake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError> {
            self.inner.submit_unstake(wallet, hotkey, netuid, amount).await
        }
    }

    struct PanickingConnector {
        ledger: Arc<FakeLedger>,
    }

    #[async_trait::async_trait]
    impl ChainConnector for PanickingConnector {
        async fn connect(&self) -> Result<Arc<dyn ChainBackend>, ChainError> {
            Ok(Arc::new(PanickingLedger { inner: self.ledger.clone() }))
        }
    }

    #[tokio::test]
    async fn test_panicking_submission_keeps_recorded_fields() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.fund(COLDKEY, 50.0).await;
        let chain = ChainClient::new(Arc::new(PanickingConnector { ledger }), COLDKEY, Duration::from_secs(2));
        let sentiment = SentimentEngine::new(
            Arc::new(CannedSearch::snippets(&["subnet chatter"])),
            Arc::new(CannedScorer::replying("80")),
        );
        let cache = CacheLayer::new(Arc::new(MemoryStore::new(100)), Duration::from_secs(60));
        let board = TaskStatusBoard::new(cache, Duration::from_secs(60));
        let store = Arc::new(MemoryHistoryStore::new());
        let orchestrator = Arc::new(TaskOrchestrator::new(Arc::new(chain), Arc::new(sentiment), board.clone(), store.clone()));
        let (queue, _worker) = spawn_worker(orchestrator, board, store.clone(), 1);

        let task_id = queue.submit(18, "hk", 5.0).await.unwrap();
        let status = wait_for_terminal(&queue, &task_id).await;
        assert_eq!(status.status, TaskStatus::Failed);

        let stored = store.get_task(&task_id).await.unwrap().unwrap().task;
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.sentiment_score, Some(0.8));
        assert_eq!(stored.action, Some(TradeAction::Stake));
        assert!(stored.error_note.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_abort_after_completion_keeps_terminal_record() {
        let h = harness("80");
        let mut task = SentimentTask::new(18, "hk", 1.0);
        for next in [
            TaskStatus::Processing,
            TaskStatus::AnalyzingSentiment,
            TaskStatus::ConnectingBlockchain,
            TaskStatus::Completed,
        ] {
            task.advance(next).unwrap();
        }
        h.store.upsert_task(&task).await.unwrap();

        h.orchestrator
            .fail_aborted(SentimentTask { status: TaskStatus::Pending, ..task.clone() }, "Task failed: late panic".to_string())
            .await;

        let stored = h.store.get_task(&task.task_id).await.unwrap().unwrap().task;
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.error_note.is_none());
    }

    struct OfflineStore;

    #[async_trait::async_trait]
    impl HistoryStore for OfflineStore {
        async fn insert_query(&self, _record: &crate::models::QueryHistoryRecord) -> Result<()> {
            Err(anyhow!("database offline"))
        }
        async fn list_queries(&self, _page: Page) -> Result<Vec<crate::models::QueryHistoryRecord>> {
            Err(anyhow!("database offline"))
        }
        async fn upsert_task(&self, _task: &SentimentTask) -> Result<()> {
            Err(anyhow!("database offline"))
        }
        async fn get_task(&self, _task_id: &str) -> Result<Option<crate::models::TaskHistoryRecord>> {
            Err(anyhow!("database offline"))
        }
        async fn list_tasks(&self, _page: Page, _status: Option<TaskStatus>) -> Result<Vec<crate::models::TaskHistoryRecord>> {
            Err(anyhow!("database offline"))
        }
    }

    #[tokio::test]
    async fn test_submit_survives_store_outage() {
        let h = harness("80");
        h.ledger.fund(COLDKEY, 50.0).await;
        let store: Arc<dyn HistoryStore> = Arc::new(OfflineStore);
        let (queue, _worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), store, 1);

        let task_id = queue.submit(18, "hk", 2.0).await.unwrap();
        assert!(!task_id.is_empty());
        assert!(queue.status(&task_id).await.status >= TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_fails_when_worker_is_gone() {
        let h = harness("80");
        let (queue, worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), h.store.clone(), 1);
        worker.abort();
        let _ = worker.await;

        let err = queue.submit(18, "hk", 2.0).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn test_unknown_task_reads_pending() {
        let h = harness("0");
        let (queue, _worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), h.store.clone(), 1);
        let status = queue.status("does-not-exist").await;
        assert_eq!(status.status, TaskStatus::Pending);
        assert!(status.result.is_none());
    }

    #[tokio::test]
    async fn test_status_falls_back_to_durable_record() {
        let h = harness("0");
        let (queue, _worker) = spawn_worker(h.orchestrator.clone(), h.board.clone(), h.store.clone(), 1);
        let mut task = SentimentTask::new(5, "hk", 1.0);
        task.fail("Insufficient stake: 0 < 1").unwrap();
        h.store.upsert_task(&task).await.unwrap();

        let status = queue.status(&task.task_id).await;
        assert_eq!(status.status, TaskStatus::Failed);
        assert_eq!(status.result.unwrap().error.as_deref(), Some("Insufficient stake: 0 < 1"));
        let live: Option<LiveTaskStatus> = h.board.lookup(&task.task_id).await;
        assert!(live.is_none());
    }
}
