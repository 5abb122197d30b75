// src/routes.rs
use log::info;
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::reject::Rejection;
use warp::{Filter, Reply};

use crate::handlers::dividends::{get_tao_dividends, DividendQuery};
use crate::handlers::error::ApiError;
use crate::handlers::history::{get_dividend_history, get_task_history, HistoryQuery};
use crate::handlers::tasks::get_task_status;
use crate::state::AppState;

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Not Found".to_string();
    } else if let Some(api_error) = err.find::<ApiError>() {
        code = api_error.status;
        message = api_error.message.clone();
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        code = StatusCode::BAD_REQUEST;
        message = e.to_string();
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method Not Allowed".to_string();
    } else {
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal Server Error".to_string();
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "error": message,
        })),
        code,
    ))
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    info!("Configuring routes...");

    let state_filter = warp::any().map(move || state.clone());

    let root_route = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "message": "Welcome to the TAO dividends API" })));

    let health_route = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })));

    let dividends_route = warp::path!("api" / "v1" / "tao_dividends")
        .and(warp::get())
        .and(warp::query::<DividendQuery>())
        .and(state_filter.clone())
        .and_then(get_tao_dividends);

    let task_status_route = warp::path!("api" / "v1" / "tasks" / String)
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(get_task_status);

    let dividend_history_route = warp::path!("api" / "v1" / "history" / "dividend-history")
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(state_filter.clone())
        .and_then(get_dividend_history);

    let task_history_route = warp::path!("api" / "v1" / "history" / "task-history")
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(state_filter.clone())
        .and_then(get_task_history);

    info!("All routes configured successfully.");

    root_route
        .or(health_route)
        .or(dividends_route)
        .or(task_status_route)
        .or(dividend_history_route)
        .or(task_history_route)
        .recover(handle_rejection)
}
