// src/services/mod.rs
pub mod cache;
pub mod chain;
pub mod db;
pub mod dividends;
pub mod history;
pub mod orchestrator;
pub mod rpc;
pub mod sentiment;
