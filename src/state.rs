// src/state.rs
use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::services::cache::{CacheLayer, MemoryStore, TaskStatusBoard};
use crate::services::chain::{spawn_reconnect_loop, ChainClient, ChainConnector};
use crate::services::db::PgHistoryStore;
use crate::services::dividends::DividendService;
use crate::services::history::{HistoryRecorder, HistoryStore, MemoryHistoryStore};
use crate::services::orchestrator::{spawn_worker, TaskOrchestrator, TaskQueue};
use crate::services::rpc::JsonRpcConnector;
use crate::services::sentiment::{ChutesScorer, DaturaSearch, ScoringProvider, SearchProvider, SentimentEngine};

/// Long-lived services shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<ChainClient>,
    pub dividends: Arc<DividendService>,
    pub tasks: TaskQueue,
    pub history: Arc<dyn HistoryStore>,
}

impl AppState {
    /// Wires the production collaborators described by `settings` and starts
    /// the task worker and the chain reconnect loop.
    pub async fn build(settings: &Settings) -> Result<(Self, JoinHandle<()>)> {
        let store: Arc<dyn HistoryStore> = match &settings.database_url {
            Some(url) => {
                info!("Using Postgres history store");
                Arc::new(PgHistoryStore::connect(url).await?)
            }
            None => {
                warn!("$DATABASE_URL not set, keeping history in memory");
                Arc::new(MemoryHistoryStore::new())
            }
        };

        let connector = Arc::new(JsonRpcConnector::new(&settings.chain_endpoint, settings.chain_timeout));
        let search = Arc::new(DaturaSearch::new(&settings.datura_api_url, &settings.datura_api_key)?);
        let scorer = Arc::new(ChutesScorer::new(&settings.chutes_api_url, &settings.chutes_api_key)?);

        let (state, worker) = Self::assemble(settings, connector, search, scorer, store);
        spawn_reconnect_loop(state.chain.clone(), settings.chain_reconnect_interval);
        Ok((state, worker))
    }

    /// Wires the given collaborators. Used by `build` and by tests.
    pub fn assemble(
        settings: &Settings,
        connector: Arc<dyn ChainConnector>,
        search: Arc<dyn SearchProvider>,
        scorer: Arc<dyn ScoringProvider>,
        store: Arc<dyn HistoryStore>,
    ) -> (Self, JoinHandle<()>) {
        let cache = CacheLayer::new(Arc::new(MemoryStore::new(settings.cache_max_entries)), settings.cache_ttl);
        let board = TaskStatusBoard::new(cache.clone(), settings.task_status_ttl);
        let chain = Arc::new(ChainClient::new(connector, settings.wallet_coldkey.clone(), settings.chain_timeout));
        let sentiment = Arc::new(SentimentEngine::new(search, scorer));

        let orchestrator = Arc::new(TaskOrchestrator::new(chain.clone(), sentiment, board.clone(), store.clone()));
        let (tasks, worker) = spawn_worker(orchestrator, board, store.clone(), settings.worker_concurrency);

        let dividends = Arc::new(DividendService::new(
            chain.clone(),
            cache,
            HistoryRecorder::new(store.clone()),
            tasks.clone(),
            settings.default_netuid,
            settings.default_hotkey.clone(),
        ));

        let state = AppState {
            chain,
            dividends,
            tasks,
            history: store,
        };
        (state, worker)
    }
}
