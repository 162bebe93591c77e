//! Tasty Candle Feeder Service
//!
//! A production service that streams candle events from the Tastytrade API
//! and stores them in TimescaleDB.
//!
//! ## Features
//! - Session authentication with remember-token persistence
//! - Resilient REST layer with exponential-backoff retry
//! - Streaming consumer with automatic reconnection
//! - Batched database writes with at-least-once delivery
//! - Health check HTTP endpoint
//! - Graceful shutdown on SIGTERM

mod client;
mod config;
mod database;
mod dxlink;
mod errors;
mod health;
mod pipeline;
mod session;

use crate::client::{ApiClient, RetryPolicy};
use crate::config::Config;
use crate::database::DatabaseWriter;
use crate::dxlink::{CandleRecord, DxLinkStreamClient};
use crate::errors::Result;
use crate::health::HealthState;
use crate::pipeline::{BatchBuffer, Flusher};
use crate::session::SessionManager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Channel buffer size between the stream consumer and the flusher.
const CANDLE_CHANNEL_SIZE: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Tasty Candle Feeder Service");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded:");
    info!("  API base URL: {}", config.api_base_url);
    info!("  Stream URL: {}", config.stream_url);
    info!("  Symbols: {}", config.symbols.join(", "));
    info!(
        "  Database: {}:{}/{}",
        config.database.host, config.database.port, config.database.name
    );
    info!("  Batch size: {} records", config.batch_size);
    info!("  Batch interval: {:?}", config.batch_interval);
    info!("  Health check port: {}", config.health_check_port);

    // Authenticate, preferring a stored remember token over the password
    let session = Arc::new(SessionManager::new(
        config.api_base_url.clone(),
        config.user_agent.clone(),
    ));
    login(&session, &config).await?;

    if let Some(token) = session.remember_token() {
        if let Err(e) = session::save_remember_token(&config.token_file, &token) {
            warn!("Failed to persist remember token: {e}");
        }
    }

    // Verify REST connectivity through the retry layer
    let api = ApiClient::new(
        session.clone(),
        config.api_base_url.clone(),
        RetryPolicy::default(),
    );
    match api.get("/customers/me", None).await {
        Ok(_) => info!("API connectivity verified"),
        Err(e) => warn!("Startup account check failed: {e}"),
    }

    // Initialize database writer
    info!("Connecting to database...");
    let db_writer = match DatabaseWriter::new(&config.database).await {
        Ok(writer) => Arc::new(writer),
        Err(e) => {
            error!("Failed to connect to database: {e}");
            return Err(e);
        }
    };

    // Create shared state
    let shutdown = Arc::new(AtomicBool::new(false));
    let health_state = HealthState::new();
    health_state.set_db_connected(true);

    let (candle_tx, candle_rx) = mpsc::channel::<CandleRecord>(CANDLE_CHANNEL_SIZE);

    let buffer = Arc::new(BatchBuffer::new(config.batch_size, config.max_backlog));
    let flusher = Arc::new(Flusher::new(
        buffer.clone(),
        db_writer.clone(),
        config.batch_interval,
    ));

    let ws_client = Arc::new(DxLinkStreamClient::new(
        config.stream_url.clone(),
        session.clone(),
        config.symbols.clone(),
        candle_tx,
    ));

    // Spawn health check server
    let health_handle = tokio::spawn({
        let state = health_state.clone();
        let port = config.health_check_port;
        async move {
            if let Err(e) = health::run_health_server(port, state).await {
                error!("Health server error: {e}");
            }
        }
    });

    // Spawn stream client
    let ws_handle = tokio::spawn({
        let client = ws_client.clone();
        async move {
            if let Err(e) = client.run().await {
                error!("Stream client error: {e}");
            }
            info!("Stream client task ended");
        }
    });

    // Spawn flusher intake and timer
    let intake_handle = tokio::spawn({
        let flusher = flusher.clone();
        async move {
            flusher.run_intake(candle_rx).await;
            info!("Flusher intake task ended");
        }
    });

    let timer_handle = tokio::spawn({
        let flusher = flusher.clone();
        async move {
            flusher.run_timer().await;
            info!("Flusher timer task ended");
        }
    });

    // Spawn metrics updater
    let metrics_handle = tokio::spawn({
        let ws_client = ws_client.clone();
        let flusher = flusher.clone();
        let buffer = buffer.clone();
        let health = health_state.clone();
        let shutdown = shutdown.clone();

        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));

            loop {
                interval.tick().await;

                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                health.set_stream_connected(ws_client.is_connected());
                health.set_candles_decoded(ws_client.candles_decoded());
                health.set_last_event_time(ws_client.last_event_time());
                health.set_candles_written(flusher.records_written());
                health.set_db_connected(flusher.sink_healthy());
                health.set_errors(flusher.flush_failures());
                health.set_buffer_size(buffer.len());
                health.set_records_dropped(
                    ws_client.records_dropped() + buffer.dropped_records(),
                );
            }
            info!("Metrics updater task ended");
        }
    });

    // Wait for shutdown signal
    info!("Service started, waiting for shutdown signal...");
    wait_for_shutdown().await;

    // Initiate graceful shutdown
    info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown.store(true, Ordering::SeqCst);
    ws_client.shutdown();
    flusher.shutdown();

    // Wait for tasks to complete with timeout
    let shutdown_timeout = Duration::from_secs(10);

    tokio::select! {
        _ = async {
            let _ = ws_handle.await;
            let _ = intake_handle.await;
            let _ = timer_handle.await;
            let _ = metrics_handle.await;
        } => {
            info!("All tasks completed gracefully");
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout reached, forcing exit");
        }
    }

    // Revoke the session
    if let Err(e) = session.destroy_session().await {
        warn!("Failed to destroy session: {e}");
    }

    // Abort health server (it doesn't have graceful shutdown)
    health_handle.abort();

    info!("Tasty Candle Feeder Service stopped");
    Ok(())
}

/// Authenticate the session, trying a persisted remember token before the
/// configured password.
async fn login(session: &SessionManager, config: &Config) -> Result<()> {
    if let Some(token) = session::load_remember_token(&config.token_file) {
        match session
            .create_session(&config.username, None, Some(&token))
            .await
        {
            Ok(()) => {
                info!("Authenticated with stored remember token");
                return Ok(());
            }
            Err(e) => warn!("Remember-token login failed, falling back to password: {e}"),
        }
    }

    session
        .create_session(&config.username, config.password.as_deref(), None)
        .await?;
    info!("Authenticated with password");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
