// src/handlers/tasks.rs
use log::info;
use warp::reply::Json;
use warp::Rejection;

use crate::handlers::error::ApiError;
use crate::state::AppState;

pub async fn get_task_status(task_id: String, state: AppState) -> Result<Json, Rejection> {
    if task_id.trim().is_empty() {
        return Err(warp::reject::custom(ApiError::bad_request("task_id must not be empty")));
    }
    let status = state.tasks.status(&task_id).await;
    info!("Task {} status: {}", task_id, status.status);
    Ok(warp::reply::json(&status))
}
