//! Tasty Candle Feeder Library
//!
//! This crate provides components for streaming candle events from the
//! Tastytrade API to TimescaleDB.

pub mod client;
pub mod config;
pub mod database;
pub mod dxlink;
pub mod errors;
pub mod health;
pub mod pipeline;
pub mod session;

pub use client::{with_retry, ApiClient, RetryPolicy};
pub use config::{Config, DatabaseConfig};
pub use database::DatabaseWriter;
pub use dxlink::{CandleRecord, DxLinkStreamClient};
pub use errors::{ApiError, FeederError, Result};
pub use health::{HealthResponse, HealthState, HealthStatus};
pub use pipeline::{BatchBuffer, CandleSink, Flusher};
pub use session::{load_remember_token, save_remember_token, SessionManager};
