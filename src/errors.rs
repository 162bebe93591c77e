//! Error types for the candle feeder service.
//!
//! Upstream HTTP failures are classified into `ApiError` kinds derived from
//! the response status and the upstream error envelope. Everything else the
//! service can fail on is collected in `FeederError`.

use serde::Deserialize;
use thiserror::Error;

/// Upstream error envelope: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Failure kinds for requests against the upstream API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP 400
    #[error("bad request: {0}")]
    BadRequest(String),

    /// HTTP 401; the stored session token is cleared when this is raised
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// HTTP 403
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// HTTP 404
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 422
    #[error("unprocessable content: {0}")]
    UnprocessableContent(String),

    /// HTTP 429
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// HTTP 5xx
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Connection-level fault before any response was received
    #[error("transport error requesting {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Any other non-2xx status
    #[error("unexpected status {status}: {message}")]
    Unexpected { status: u16, message: String },
}

impl ApiError {
    /// Classify a non-2xx response into its failure kind.
    ///
    /// The body is expected to carry the upstream error envelope; when it
    /// does not decode, the raw status still surfaces with a body snippet
    /// as the message.
    pub fn classify(status: u16, body: &str) -> Self {
        let detail = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => format!("{} - {}", envelope.error.code, envelope.error.message),
            Err(_) => body.chars().take(120).collect(),
        };

        match status {
            400 => Self::BadRequest(detail),
            401 => Self::Unauthorized(detail),
            403 => Self::Forbidden(detail),
            404 => Self::NotFound(detail),
            422 => Self::UnprocessableContent(detail),
            429 => Self::TooManyRequests(detail),
            500..=599 => Self::Server {
                status,
                message: detail,
            },
            _ => Self::Unexpected {
                status,
                message: detail,
            },
        }
    }

    /// Wrap a connection-level fault, keeping the failing URL.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    /// Whether the retry policy may re-attempt a request that failed with
    /// this kind. Only rate limiting and server errors qualify; transport
    /// faults are the caller's reconnect problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TooManyRequests(_) | Self::Server { .. })
    }
}

/// Main error type for the feeder service.
#[derive(Error, Debug)]
pub enum FeederError {
    /// Upstream API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// WebSocket connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Database connection and query errors
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Database pool errors
    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or conflicting login credentials, caught before any network call
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Channel communication errors
    #[error("channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl FeederError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credentials error with a message.
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a channel error with a message.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}

/// Result type alias using FeederError.
pub type Result<T> = std::result::Result<T, FeederError>;
