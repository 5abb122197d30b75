// src/config.rs
use log::warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOTKEY: &str = "5FFApaS75bv5pJHfAp2FVLBj9ZaXuFDjEypsaBNc1wCfe52v";
pub const DATURA_SEARCH_URL: &str = "https://api.datura.ai/twitter/search";
pub const CHUTES_SCORING_URL: &str = "https://api.chutes.ai/api/chute/20acffc0-0c5f-58e3-97af-21fc0b261ec4";

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: Option<String>,
    pub cache_ttl: Duration,
    pub task_status_ttl: Duration,
    pub cache_max_entries: u64,
    pub datura_api_url: String,
    pub datura_api_key: String,
    pub chutes_api_url: String,
    pub chutes_api_key: String,
    pub chain_endpoint: String,
    pub wallet_coldkey: String,
    pub default_netuid: i32,
    pub default_hotkey: String,
    pub chain_timeout: Duration,
    pub chain_reconnect_interval: Duration,
    pub worker_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 3030,
            database_url: None,
            cache_ttl: Duration::from_secs(120),
            task_status_ttl: Duration::from_secs(3600),
            cache_max_entries: 10_000,
            datura_api_url: DATURA_SEARCH_URL.to_string(),
            datura_api_key: String::new(),
            chutes_api_url: CHUTES_SCORING_URL.to_string(),
            chutes_api_key: String::new(),
            chain_endpoint: "http://127.0.0.1:9933".to_string(),
            wallet_coldkey: DEFAULT_HOTKEY.to_string(),
            default_netuid: 18,
            default_hotkey: DEFAULT_HOTKEY.to_string(),
            chain_timeout: Duration::from_secs(30),
            chain_reconnect_interval: Duration::from_secs(60),
            worker_concurrency: 4,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment. Call `dotenv().ok()`
    /// first to pick up a local `.env`.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            port: parsed("PORT", defaults.port),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            cache_ttl: Duration::from_secs(parsed("CACHE_TTL", defaults.cache_ttl.as_secs())),
            task_status_ttl: Duration::from_secs(parsed("TASK_STATUS_TTL", defaults.task_status_ttl.as_secs())),
            cache_max_entries: parsed("CACHE_MAX_ENTRIES", defaults.cache_max_entries),
            datura_api_url: text("DATURA_API_URL", defaults.datura_api_url),
            datura_api_key: text("DATURA_API_KEY", defaults.datura_api_key),
            chutes_api_url: text("CHUTES_API_URL", defaults.chutes_api_url),
            chutes_api_key: text("CHUTES_API_KEY", defaults.chutes_api_key),
            chain_endpoint: text("CHAIN_ENDPOINT", defaults.chain_endpoint),
            wallet_coldkey: text("WALLET_COLDKEY", defaults.wallet_coldkey),
            default_netuid: parsed("DEFAULT_NETUID", defaults.default_netuid),
            default_hotkey: text("DEFAULT_HOTKEY", defaults.default_hotkey),
            chain_timeout: Duration::from_secs(parsed("CHAIN_TIMEOUT_SECS", defaults.chain_timeout.as_secs())),
            chain_reconnect_interval: Duration::from_secs(
                parsed("CHAIN_RECONNECT_SECS", defaults.chain_reconnect_interval.as_secs()).max(1),
            ),
            worker_concurrency: parsed("WORKER_CONCURRENCY", defaults.worker_concurrency).max(1),
        }
    }
}

fn text(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn parsed<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("${} is not valid ({:?}), defaulting to {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
