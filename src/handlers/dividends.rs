// src/handlers/dividends.rs
use log::{error, info};
use serde::Deserialize;
use warp::reply::Json;
use warp::Rejection;

use crate::handlers::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DividendQuery {
    pub netuid: Option<i32>,
    pub hotkey: Option<String>,
    #[serde(default)]
    pub trade: bool,
}

pub async fn get_tao_dividends(query: DividendQuery, state: AppState) -> Result<Json, Rejection> {
    info!(
        "Dividend query: netuid={:?}, hotkey={:?}, trade={}",
        query.netuid, query.hotkey, query.trade
    );
    match state.dividends.query(query.netuid, query.hotkey, query.trade).await {
        Ok(response) => Ok(warp::reply::json(&response)),
        Err(e) => {
            error!("Failed to serve dividend query: {:#}", e);
            Err(warp::reject::custom(ApiError::new(format!("Failed to process request: {}", e))))
        }
    }
}
