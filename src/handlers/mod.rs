// src/handlers/mod.rs
pub mod dividends;
pub mod error;
pub mod history;
pub mod tasks;
