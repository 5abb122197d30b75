use dotenv::dotenv;
use log::{error, info};
use std::net::SocketAddr;
use warp::Filter;

use tao_dividends_api::config::Settings;
use tao_dividends_api::routes;
use tao_dividends_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    info!("Logger initialized. Starting the application...");

    let settings = Settings::from_env();
    info!("Using PORT: {}", settings.port);

    let (state, worker) = match AppState::build(&settings).await {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to initialize services: {:#}", e);
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!("Will bind to: {}", addr);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_header("content-type")
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"]);

    let api = routes::routes(state)
        .with(cors)
        .with(warp::log("tao_dividends_api::http"));
    info!("Routes configured successfully with CORS.");

    info!("Starting server on {}", addr);
    warp::serve(api).run(addr).await;

    worker.abort();
}
