//! Health check HTTP server module.
//!
//! Provides a /health endpoint that returns pipeline status:
//! - Connection states (stream, database)
//! - Ingestion and delivery counters
//! - Buffer depth and backlog drops

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Health check response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, or unhealthy
    pub status: HealthStatus,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Total candles decoded from the stream
    pub candles_decoded: u64,
    /// Total candles persisted
    pub candles_written: u64,
    /// Records discarded (malformed or backlog pressure)
    pub records_dropped: u64,
    /// Records currently awaiting persistence
    pub buffer_size: usize,
    /// Stream connection status
    pub stream_connected: bool,
    /// Database connection status
    pub database_connected: bool,
    /// Timestamp of the last decoded event
    pub last_event_time: Option<DateTime<Utc>>,
    /// Error count since startup
    pub errors: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Shared state for health checks.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthStateInner>,
}

struct HealthStateInner {
    start_time: Instant,
    candles_decoded: AtomicU64,
    candles_written: AtomicU64,
    records_dropped: AtomicU64,
    buffer_size: AtomicU64,
    errors: AtomicU64,
    last_event_time: RwLock<Option<DateTime<Utc>>>,
    stream_connected: RwLock<bool>,
    db_connected: RwLock<bool>,
}

impl HealthState {
    /// Create a new health state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HealthStateInner {
                start_time: Instant::now(),
                candles_decoded: AtomicU64::new(0),
                candles_written: AtomicU64::new(0),
                records_dropped: AtomicU64::new(0),
                buffer_size: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                last_event_time: RwLock::new(None),
                stream_connected: RwLock::new(false),
                db_connected: RwLock::new(false),
            }),
        }
    }

    /// Update candles decoded count.
    pub fn set_candles_decoded(&self, count: u64) {
        self.inner.candles_decoded.store(count, Ordering::SeqCst);
    }

    /// Update candles written count.
    pub fn set_candles_written(&self, count: u64) {
        self.inner.candles_written.store(count, Ordering::SeqCst);
    }

    /// Update dropped records count.
    pub fn set_records_dropped(&self, count: u64) {
        self.inner.records_dropped.store(count, Ordering::SeqCst);
    }

    /// Update buffer depth.
    pub fn set_buffer_size(&self, size: usize) {
        self.inner.buffer_size.store(size as u64, Ordering::SeqCst);
    }

    /// Update error count.
    pub fn set_errors(&self, count: u64) {
        self.inner.errors.store(count, Ordering::SeqCst);
    }

    /// Update last decoded event time.
    pub fn set_last_event_time(&self, time: Option<DateTime<Utc>>) {
        *self.inner.last_event_time.write() = time;
    }

    /// Update stream connection status.
    pub fn set_stream_connected(&self, connected: bool) {
        *self.inner.stream_connected.write() = connected;
    }

    /// Update database connection status.
    pub fn set_db_connected(&self, connected: bool) {
        *self.inner.db_connected.write() = connected;
    }

    /// Build health response.
    pub fn build_response(&self) -> HealthResponse {
        let stream_connected = *self.inner.stream_connected.read();
        let db_connected = *self.inner.db_connected.read();
        let last_event_time = *self.inner.last_event_time.read();
        let errors = self.inner.errors.load(Ordering::SeqCst);

        let status = self.determine_status(db_connected, stream_connected, errors, last_event_time);

        HealthResponse {
            status,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
            candles_decoded: self.inner.candles_decoded.load(Ordering::SeqCst),
            candles_written: self.inner.candles_written.load(Ordering::SeqCst),
            records_dropped: self.inner.records_dropped.load(Ordering::SeqCst),
            buffer_size: self.inner.buffer_size.load(Ordering::SeqCst) as usize,
            stream_connected,
            database_connected: db_connected,
            last_event_time,
            errors,
            timestamp: Utc::now(),
        }
    }

    /// Determine overall health status.
    fn determine_status(
        &self,
        db_connected: bool,
        stream_connected: bool,
        errors: u64,
        last_event_time: Option<DateTime<Utc>>,
    ) -> HealthStatus {
        if !db_connected || !stream_connected {
            return HealthStatus::Unhealthy;
        }

        // Stale data: no decoded events for 2+ minutes
        if let Some(last) = last_event_time {
            let elapsed = Utc::now() - last;
            if elapsed.num_seconds() > 120 {
                return HealthStatus::Unhealthy;
            }
            if elapsed.num_seconds() > 60 {
                return HealthStatus::Degraded;
            }
        }

        if errors > 10 {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Health check handler.
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let response = state.build_response();

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Readiness check handler.
async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    let stream_connected = *state.inner.stream_connected.read();
    let db_connected = *state.inner.db_connected.read();

    if stream_connected && db_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check handler.
async fn live_handler() -> StatusCode {
    StatusCode::OK
}

/// Create the health check router.
pub fn create_health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Run the health check server.
pub async fn run_health_server(port: u16, state: HealthState) -> std::io::Result<()> {
    let app = create_health_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("health check server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn counters_flow_into_the_response() {
        let state = HealthState::new();

        let response = state.build_response();
        assert_eq!(response.candles_decoded, 0);
        assert_eq!(response.candles_written, 0);
        assert!(response.last_event_time.is_none());

        state.set_candles_decoded(100);
        state.set_candles_written(95);
        state.set_records_dropped(2);
        state.set_buffer_size(3);
        state.set_stream_connected(true);
        state.set_db_connected(true);
        state.set_last_event_time(Some(Utc::now()));

        let response = state.build_response();
        assert_eq!(response.candles_decoded, 100);
        assert_eq!(response.candles_written, 95);
        assert_eq!(response.records_dropped, 2);
        assert_eq!(response.buffer_size, 3);
        assert!(response.stream_connected);
        assert!(response.database_connected);
        assert_eq!(response.status, HealthStatus::Healthy);
    }

    #[test]
    fn disconnection_is_unhealthy() {
        let state = HealthState::new();

        state.set_db_connected(false);
        state.set_stream_connected(true);
        assert_eq!(state.build_response().status, HealthStatus::Unhealthy);

        state.set_db_connected(true);
        state.set_stream_connected(false);
        assert_eq!(state.build_response().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn error_pressure_is_degraded() {
        let state = HealthState::new();
        state.set_db_connected(true);
        state.set_stream_connected(true);
        state.set_last_event_time(Some(Utc::now()));
        state.set_errors(15);

        assert_eq!(state.build_response().status, HealthStatus::Degraded);
    }

    #[test]
    fn stale_events_degrade_then_fail() {
        let state = HealthState::new();
        state.set_db_connected(true);
        state.set_stream_connected(true);

        state.set_last_event_time(Some(Utc::now() - chrono::Duration::seconds(90)));
        assert_eq!(state.build_response().status, HealthStatus::Degraded);

        state.set_last_event_time(Some(Utc::now() - chrono::Duration::seconds(180)));
        assert_eq!(state.build_response().status, HealthStatus::Unhealthy);
    }
}
