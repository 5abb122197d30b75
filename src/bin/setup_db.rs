// src/bin/setup_db.rs
use dotenv::dotenv;
use std::env;
use tao_dividends_api::services::db::PgHistoryStore;
use tao_dividends_api::services::history::{HistoryStore, Page};
use tao_dividends_api::BoxError;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let database_url = env::var("DATABASE_URL")?;

    // connect() applies the schema
    let store = PgHistoryStore::connect(&database_url).await?;

    let queries = store.list_queries(Page::new(None, Some(1))).await?;
    let tasks = store.list_tasks(Page::new(None, Some(1)), None).await?;
    println!("History tables ready.");
    println!("Latest query: {:?}", queries.first().map(|q| (&q.query_id, q.created_at)));
    println!("Latest task:  {:?}", tasks.first().map(|t| (&t.task.task_id, t.task.status)));
    Ok(())
}
