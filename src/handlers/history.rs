// src/handlers/history.rs
use log::error;
use serde::Deserialize;
use warp::reply::Json;
use warp::Rejection;

use crate::handlers::error::ApiError;
use crate::models::TaskStatus;
use crate::services::history::Page;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
}

impl HistoryQuery {
    fn page(&self) -> Page {
        Page::new(self.skip, self.limit)
    }
}

pub async fn get_dividend_history(query: HistoryQuery, state: AppState) -> Result<Json, Rejection> {
    match state.history.list_queries(query.page()).await {
        Ok(rows) => Ok(warp::reply::json(&rows)),
        Err(e) => {
            error!("Failed to list dividend history: {:#}", e);
            Err(warp::reject::custom(ApiError::new("Failed to load dividend history")))
        }
    }
}

pub async fn get_task_history(query: HistoryQuery, state: AppState) -> Result<Json, Rejection> {
    let status = match query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| warp::reject::custom(ApiError::bad_request(e)))?,
        ),
        None => None,
    };

    match state.history.list_tasks(query.page(), status).await {
        Ok(rows) => Ok(warp::reply::json(&rows)),
        Err(e) => {
            error!("Failed to list task history: {:#}", e);
            Err(warp::reject::custom(ApiError::new("Failed to load task history")))
        }
    }
}
