// src/testing.rs
//! In-memory stand-ins for the chain, search and scoring collaborators.
//! Used by the unit tests and by the integration suite under `tests/`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::services::chain::{ChainBackend, ChainConnector, ChainError, NeuronInfo, Submission};
use crate::services::sentiment::{ScoringProvider, SearchProvider};

pub const COLDKEY: &str = "5ColdkeyFundingWallet";

#[derive(Default)]
struct LedgerState {
    block: u64,
    balances: HashMap<String, f64>,
    neurons: HashMap<(i32, String), NeuronInfo>,
    dividends: HashMap<(i32, String), f64>,
    fail_queries: bool,
    failing_submissions: u32,
    reject_submissions: bool,
    submissions: usize,
    snapshot_reads: usize,
}

/// A ledger held in memory. Stake submissions move funds from the wallet
/// balance into the neuron's stake.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, hotkey: &str, netuid: i32, stake: f64, dividends: f64) {
        let mut state = self.state.lock().await;
        state.neurons.insert((netuid, hotkey.to_string()), NeuronInfo { stake });
        state.dividends.insert((netuid, hotkey.to_string()), dividends);
    }

    pub async fn fund(&self, address: &str, amount: f64) {
        self.state.lock().await.balances.insert(address.to_string(), amount);
    }

    pub async fn fail_queries(&self, fail: bool) {
        self.state.lock().await.fail_queries = fail;
    }

    pub async fn fail_next_submissions(&self, count: u32) {
        self.state.lock().await.failing_submissions = count;
    }

    pub async fn reject_submissions(&self, reject: bool) {
        self.state.lock().await.reject_submissions = reject;
    }

    pub async fn submissions(&self) -> usize {
        self.state.lock().await.submissions
    }

    /// Number of block-hash reads, i.e. fresh snapshot fetches.
    pub async fn snapshot_reads(&self) -> usize {
        self.state.lock().await.snapshot_reads
    }

    pub async fn balance_of(&self, address: &str) -> f64 {
        self.state.lock().await.balances.get(address).copied().unwrap_or(0.0)
    }

    async fn submit(&self, wallet: &str, hotkey: &str, netuid: i32, delta: f64) -> Result<Submission, ChainError> {
        let mut state = self.state.lock().await;
        state.submissions += 1;
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(ChainError::Transient("connection reset by peer".to_string()));
        }
        if state.reject_submissions {
            return Err(ChainError::Rejected("extrinsic rejected".to_string()));
        }

        let key = (netuid, hotkey.to_string());
        let stake = state.neurons.get(&key).map(|n| n.stake).unwrap_or(0.0);
        state.neurons.insert(key, NeuronInfo { stake: stake + delta });
        *state.balances.entry(wallet.to_string()).or_insert(0.0) -= delta;
        state.block += 1;
        Ok(Submission {
            success: true,
            tx_ref: Some(format!("0x{:064x}", state.block)),
            message: None,
        })
    }

    async fn check(&self) -> Result<(), ChainError> {
        if self.state.lock().await.fail_queries {
            Err(ChainError::Transient("rpc node unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainBackend for FakeLedger {
    async fn get_block_hash(&self) -> Result<String, ChainError> {
        self.check().await?;
        let mut state = self.state.lock().await;
        state.snapshot_reads += 1;
        Ok(format!("0x{:064x}", state.block))
    }

    async fn get_neuron(&self, hotkey: &str, netuid: i32, _block_hash: Option<&str>) -> Result<Option<NeuronInfo>, ChainError> {
        self.check().await?;
        Ok(self.state.lock().await.neurons.get(&(netuid, hotkey.to_string())).copied())
    }

    async fn get_dividends(&self, netuid: i32, hotkey: &str, _block_hash: &str) -> Result<f64, ChainError> {
        self.check().await?;
        Ok(self.state.lock().await.dividends.get(&(netuid, hotkey.to_string())).copied().unwrap_or(0.0))
    }

    async fn get_balance(&self, address: &str, _block_hash: Option<&str>) -> Result<f64, ChainError> {
        self.check().await?;
        Ok(self.balance_of(address).await)
    }

    async fn submit_stake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError> {
        self.submit(wallet, hotkey, netuid, amount).await
    }

    async fn submit_unstake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError> {
        self.submit(wallet, hotkey, netuid, -amount).await
    }
}

pub struct FakeConnector {
    ledger: Arc<FakeLedger>,
    failing: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(ledger: Arc<FakeLedger>) -> Self {
        FakeConnector {
            ledger,
            failing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let connector = Self::new(Arc::new(FakeLedger::new()));
        connector.set_failing(true);
        connector
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainBackend>, ChainError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // widen the window so concurrent first callers overlap
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChainError::Unavailable("websocket handshake failed".to_string()));
        }
        Ok(self.ledger.clone())
    }
}

/// Search provider returning a fixed result.
pub struct CannedSearch {
    reply: std::result::Result<Vec<String>, String>,
    queries: Mutex<Vec<String>>,
}

impl CannedSearch {
    pub fn snippets(snippets: &[&str]) -> Self {
        CannedSearch {
            reply: Ok(snippets.iter().map(|s| s.to_string()).collect()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        CannedSearch {
            reply: Err(message.to_string()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl SearchProvider for CannedSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<String>> {
        self.queries.lock().await.push(query.to_string());
        self.reply.clone().map_err(|e| anyhow!(e))
    }
}

/// Scoring provider returning a fixed completion and recording prompts.
pub struct CannedScorer {
    reply: std::result::Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl CannedScorer {
    pub fn replying(text: &str) -> Self {
        CannedScorer {
            reply: Ok(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        CannedScorer {
            reply: Err(message.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl ScoringProvider for CannedScorer {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().await.push(prompt.to_string());
        self.reply.clone().map_err(|e| anyhow!(e))
    }
}
