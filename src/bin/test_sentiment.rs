// src/bin/test_sentiment.rs
use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use tao_dividends_api::config::Settings;
use tao_dividends_api::models::TradeAction;
use tao_dividends_api::services::sentiment::{fallback_corpus, ChutesScorer, DaturaSearch, SentimentEngine};
use tao_dividends_api::BoxError;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let settings = Settings::from_env();
    let netuid: i32 = match env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => settings.default_netuid,
    };

    println!("Fallback corpus for subnet {}:", netuid);
    for snippet in fallback_corpus(netuid) {
        println!("  {}", snippet);
    }

    let engine = SentimentEngine::new(
        Arc::new(DaturaSearch::new(&settings.datura_api_url, &settings.datura_api_key)?),
        Arc::new(ChutesScorer::new(&settings.chutes_api_url, &settings.chutes_api_key)?),
    );
    let score = engine.score_subnet(netuid).await;
    println!("Sentiment score: {:.2}", score);
    println!("Decision:        {}", TradeAction::decide(score));
    Ok(())
}
