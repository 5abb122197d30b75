// src/lib.rs

pub mod config;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
