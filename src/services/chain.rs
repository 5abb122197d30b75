// src/services/chain.rs
use async_trait::async_trait;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::{sleep, timeout};

use crate::models::{ActionResult, DividendSnapshot};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    /// Network blips, timeouts, overloaded nodes. Safe to retry.
    #[error("transient chain failure: {0}")]
    Transient(String),
    /// The ledger refused the request. Retrying will not help.
    #[error("chain rejected request: {0}")]
    Rejected(String),
    #[error("chain unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuronInfo {
    pub stake: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub success: bool,
    pub tx_ref: Option<String>,
    pub message: Option<String>,
}

/// Logical operations the service needs from the ledger. Signing and
/// consensus stay on the other side of this trait.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn get_block_hash(&self) -> Result<String, ChainError>;
    async fn get_neuron(&self, hotkey: &str, netuid: i32, block_hash: Option<&str>) -> Result<Option<NeuronInfo>, ChainError>;
    async fn get_dividends(&self, netuid: i32, hotkey: &str, block_hash: &str) -> Result<f64, ChainError>;
    async fn get_balance(&self, address: &str, block_hash: Option<&str>) -> Result<f64, ChainError>;
    async fn submit_stake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError>;
    async fn submit_unstake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError>;
}

/// Establishes the long-lived session used by `ChainClient`.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ChainBackend>, ChainError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

type Session = Result<Arc<dyn ChainBackend>, String>;

pub struct ChainClient {
    connector: Arc<dyn ChainConnector>,
    session: RwLock<Arc<OnceCell<Session>>>,
    coldkey: String,
    query_timeout: Duration,
    retry: RetryPolicy,
}

impl ChainClient {
    pub fn new(connector: Arc<dyn ChainConnector>, coldkey: impl Into<String>, query_timeout: Duration) -> Self {
        ChainClient {
            connector,
            session: RwLock::new(Arc::new(OnceCell::new())),
            coldkey: coldkey.into(),
            query_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the shared session, connecting on first use. Concurrent first
    /// callers wait on the same attempt; a failed attempt is remembered.
    async fn session(&self) -> Session {
        let cell = self.session.read().await.clone();
        cell.get_or_init(|| async {
            info!("Connecting to chain...");
            match timeout(self.query_timeout, self.connector.connect()).await {
                Ok(Ok(backend)) => {
                    info!("Chain session established");
                    Ok(backend)
                }
                Ok(Err(e)) => {
                    error!("Chain initialization failed: {}", e);
                    Err(e.to_string())
                }
                Err(_) => {
                    error!("Chain initialization timed out after {:?}", self.query_timeout);
                    Err(format!("chain connection timed out after {:?}", self.query_timeout))
                }
            }
        })
        .await
        .clone()
    }

    /// Explicitly retries a failed initialization. A healthy session is kept.
    pub async fn reconnect(&self) -> bool {
        {
            let mut slot = self.session.write().await;
            if matches!(slot.get(), Some(Err(_))) {
                warn!("Discarding failed chain session and reconnecting");
                *slot = Arc::new(OnceCell::new());
            }
        }
        self.session().await.is_ok()
    }

    pub async fn has_failed_session(&self) -> bool {
        matches!(self.session.read().await.get(), Some(Err(_)))
    }

    pub async fn fetch_dividends(&self, netuid: i32, hotkey: &str) -> DividendSnapshot {
        let backend = match self.session().await {
            Ok(backend) => backend,
            Err(msg) => {
                warn!("Serving degraded snapshot for {}:{}: {}", netuid, hotkey, msg);
                return DividendSnapshot::unavailable(netuid, hotkey, msg);
            }
        };

        info!("Querying chain for dividends: netuid={}, hotkey={}", netuid, hotkey);
        match timeout(self.query_timeout, query_snapshot(backend.as_ref(), netuid, hotkey)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                error!("Error querying chain: {}", e);
                DividendSnapshot::unavailable(netuid, hotkey, e.to_string())
            }
            Err(_) => {
                error!("Chain query timed out for {}:{}", netuid, hotkey);
                DividendSnapshot::unavailable(netuid, hotkey, format!("chain query timed out after {:?}", self.query_timeout))
            }
        }
    }

    pub async fn stake(&self, netuid: i32, hotkey: &str, amount: f64) -> ActionResult {
        if let Some(rejection) = check_amount(amount) {
            return rejection;
        }
        let backend = match self.session().await {
            Ok(backend) => backend,
            Err(msg) => return ActionResult::failed(format!("Staking error: {}", msg)),
        };
        let backend = backend.as_ref();

        info!("Staking {} TAO to hotkey {} on subnet {}", amount, hotkey, netuid);
        let balance = match self.bounded(backend.get_balance(&self.coldkey, None)).await {
            Ok(balance) => balance,
            Err(e) => return ActionResult::failed(format!("Staking error: {}", e)),
        };
        if balance < amount {
            return ActionResult::failed(format!("Insufficient balance: {} < {}", balance, amount));
        }

        let coldkey = self.coldkey.as_str();
        let submitted = self
            .submit_with_retry("stake", move || backend.submit_stake(coldkey, hotkey, netuid, amount))
            .await;
        self.settle(backend, netuid, hotkey, submitted, format!("Successfully staked {} TAO to {}", amount, hotkey), "Staking")
            .await
    }

    pub async fn unstake(&self, netuid: i32, hotkey: &str, amount: f64) -> ActionResult {
        if let Some(rejection) = check_amount(amount) {
            return rejection;
        }
        let backend = match self.session().await {
            Ok(backend) => backend,
            Err(msg) => return ActionResult::failed(format!("Unstaking error: {}", msg)),
        };
        let backend = backend.as_ref();

        info!("Unstaking {} TAO from hotkey {} on subnet {}", amount, hotkey, netuid);
        let current_stake = match self.bounded(backend.get_neuron(hotkey, netuid, None)).await {
            Ok(Some(neuron)) => neuron.stake,
            Ok(None) => {
                return ActionResult::failed(format!("Neuron not found for hotkey {} on subnet {}", hotkey, netuid))
            }
            Err(e) => return ActionResult::failed(format!("Unstaking error: {}", e)),
        };
        if current_stake < amount {
            return ActionResult::failed(format!("Insufficient stake: {} < {}", current_stake, amount));
        }

        let coldkey = self.coldkey.as_str();
        let submitted = self
            .submit_with_retry("unstake", move || backend.submit_unstake(coldkey, hotkey, netuid, amount))
            .await;
        self.settle(backend, netuid, hotkey, submitted, format!("Successfully unstaked {} TAO from {}", amount, hotkey), "Unstaking")
            .await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: Future<Output = Result<T, ChainError>>,
    {
        match timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Transient(format!("timed out after {:?}", self.query_timeout))),
        }
    }

    /// Submits with exponential backoff. Only transient failures are retried.
    async fn submit_with_retry<F, Fut>(&self, label: &str, op: F) -> Result<Submission, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Submission, ChainError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.bounded(op()).await {
                Ok(submission) => return Ok(submission),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempt(s): {}", label, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn settle(
        &self,
        backend: &dyn ChainBackend,
        netuid: i32,
        hotkey: &str,
        submitted: Result<Submission, ChainError>,
        success_message: String,
        verb: &str,
    ) -> ActionResult {
        match submitted {
            Ok(submission) if submission.success => {
                let new_stake = match self.bounded(backend.get_neuron(hotkey, netuid, None)).await {
                    Ok(neuron) => Some(neuron.map(|n| n.stake).unwrap_or(0.0)),
                    Err(e) => {
                        warn!("Could not read back stake for {} on subnet {}: {}", hotkey, netuid, e);
                        None
                    }
                };
                ActionResult::succeeded(success_message, new_stake, submission.tx_ref)
            }
            Ok(submission) => {
                let reason = submission.message.unwrap_or_else(|| "no reason given".to_string());
                ActionResult::failed(format!("{} failed: {}", verb, reason))
            }
            Err(e) => ActionResult::failed(format!("{} error: {}", verb, e)),
        }
    }
}

/// Periodically retries a failed chain session so a node that was down at
/// boot is picked up without a restart. A healthy session is never touched.
pub fn spawn_reconnect_loop(client: Arc<ChainClient>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if client.has_failed_session().await {
                if client.reconnect().await {
                    info!("Chain session recovered");
                } else {
                    warn!("Chain still unreachable, next attempt in {:?}", every);
                }
            }
        }
    })
}

fn check_amount(amount: f64) -> Option<ActionResult> {
    if amount.is_finite() && amount > 0.0 {
        None
    } else {
        Some(ActionResult::failed(format!("Amount must be greater than zero (got {})", amount)))
    }
}

async fn query_snapshot(backend: &dyn ChainBackend, netuid: i32, hotkey: &str) -> Result<DividendSnapshot, ChainError> {
    // One block hash pins every read to the same chain state.
    let block_hash = backend.get_block_hash().await?;
    let neuron = backend.get_neuron(hotkey, netuid, Some(&block_hash)).await?;
    let dividends = backend.get_dividends(netuid, hotkey, &block_hash).await?;
    let balance = backend.get_balance(hotkey, Some(&block_hash)).await?;

    Ok(DividendSnapshot::fresh(
        netuid,
        hotkey,
        dividends,
        neuron.map(|n| n.stake).unwrap_or(0.0),
        balance,
        neuron.is_some(),
    ))
}
