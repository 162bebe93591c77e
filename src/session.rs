//! Session manager for the Tastytrade REST API.
//!
//! Owns the credential lifecycle:
//! - Session creation from a password or a persisted remember token
//! - Session destruction (revoke + clear)
//! - Header construction for outbound requests
//! - Token invalidation on any 401 response
//!
//! Token values are never written to the log.

use crate::errors::{ApiError, FeederError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout applied to every session HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Credential fields for one authenticated upstream connection.
#[derive(Debug, Default)]
struct SessionState {
    session_token: Option<String>,
    remember_token: Option<String>,
    session_expiration: Option<DateTime<Utc>>,
}

/// Manages one session against the upstream API.
///
/// All credential fields live behind a single lock: login, logout, and
/// 401 handling write them; every outbound request reads them.
pub struct SessionManager {
    base_url: String,
    user_agent: String,
    http: reqwest::Client,
    state: RwLock<SessionState>,
}

impl SessionManager {
    /// Create a session manager with no active credential.
    pub fn new(base_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into(),
            user_agent: user_agent.into(),
            http,
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Whether a session token is currently held.
    pub fn has_session(&self) -> bool {
        self.state.read().session_token.is_some()
    }

    /// Current session token, if any.
    pub fn session_token(&self) -> Option<String> {
        self.state.read().session_token.clone()
    }

    /// Current remember token, if any.
    pub fn remember_token(&self) -> Option<String> {
        self.state.read().remember_token.clone()
    }

    /// Recorded session expiration. Absent means the upstream did not
    /// provide one; the session is assumed valid until a 401 disproves it.
    pub fn session_expiration(&self) -> Option<DateTime<Utc>> {
        self.state.read().session_expiration
    }

    /// Create a new session with a password or a remember token.
    ///
    /// Exactly one of the two must be supplied; neither being present fails
    /// before any network call.
    pub async fn create_session(
        &self,
        username: &str,
        password: Option<&str>,
        remember_token: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "login": username,
            "remember-me": true,
        });

        if let Some(password) = password {
            payload["password"] = Value::String(password.to_string());
            debug!("authenticating with password");
        } else if let Some(token) = remember_token {
            payload["remember-token"] = Value::String(token.to_string());
            debug!("authenticating with remember token");
        } else {
            error!("neither password nor remember token provided");
            return Err(FeederError::credentials(
                "either a password or a remember token must be provided",
            ));
        }

        info!("creating a new session");
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.base_headers())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;

        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            let body: Value = response
                .json()
                .await
                .map_err(|e| ApiError::transport(&url, e))?;
            self.apply_session_data(&body["data"]);
            info!("session created successfully");
            Ok(())
        } else {
            warn!("unexpected status creating session: {status}");
            let body = response.text().await.unwrap_or_default();
            Err(self.handle_error(status, &body).into())
        }
    }

    /// Destroy the current session.
    ///
    /// With no active token this is a logged no-op. The credential fields
    /// are cleared only on a confirmed success status; on failure the
    /// in-memory state stays untouched so the caller can retry.
    pub async fn destroy_session(&self) -> Result<()> {
        if !self.has_session() {
            warn!("no active session to destroy");
            return Ok(());
        }

        info!("destroying the current session");
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .http
            .delete(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;

        let status = response.status().as_u16();
        if status == 204 || status == 200 {
            *self.state.write() = SessionState::default();
            info!("session destroyed successfully");
            Ok(())
        } else {
            warn!("unexpected status destroying session: {status}");
            let body = response.text().await.unwrap_or_default();
            Err(self.handle_error(status, &body).into())
        }
    }

    /// Headers for an outbound request. The authorization header carries
    /// the raw session token (no bearer prefix) and is present only while
    /// a token is held.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.base_headers();
        if let Some(token) = self.state.read().session_token.as_deref() {
            match HeaderValue::from_str(token) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => warn!("session token is not a valid header value: {e}"),
            }
        }
        headers
    }

    /// Classify a non-2xx response, clearing the stored session token as a
    /// side effect whenever the response is unauthorized. Every request
    /// path routes its failures through here so a 401 anywhere forces the
    /// next call to re-authenticate.
    pub fn handle_error(&self, status: u16, body: &str) -> ApiError {
        let err = ApiError::classify(status, body);
        if matches!(err, ApiError::Unauthorized(_)) {
            warn!("unauthorized response, clearing stored session token");
            self.state.write().session_token = None;
        }
        error!("API responded with error: {status} {err}");
        err
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    /// Store the credential fields from a successful session response.
    fn apply_session_data(&self, data: &Value) {
        let mut state = self.state.write();

        state.session_token = data["session-token"].as_str().map(str::to_owned);
        if state.session_token.is_none() {
            warn!("session response did not include a session token");
        }

        state.remember_token = data["remember-token"].as_str().map(str::to_owned);

        state.session_expiration = match data["session-expiration"].as_str() {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(parsed) => {
                    let expiration = parsed.with_timezone(&Utc);
                    info!("session will expire at {expiration}");
                    Some(expiration)
                }
                Err(e) => {
                    warn!("unparseable session expiration {raw:?}: {e}");
                    None
                }
            },
            None => {
                warn!("session expiration not provided in the response");
                None
            }
        };
    }
}

/// On-disk remember-token file: a single JSON object.
#[derive(Debug, Serialize, Deserialize)]
struct StoredTokens {
    remember_token: String,
}

/// Persist a remember token so the next run can authenticate without a
/// password. Failures are logged, not fatal.
pub fn save_remember_token(path: &Path, token: &str) -> Result<()> {
    let json = serde_json::to_string(&StoredTokens {
        remember_token: token.to_string(),
    })?;
    std::fs::write(path, json)?;
    info!("remember token saved to {}", path.display());
    Ok(())
}

/// Load a persisted remember token. Returns None when the file is missing
/// or unreadable; both cases are logged.
pub fn load_remember_token(path: &Path) -> Option<String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no token file at {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("failed to read token file {}: {e}", path.display());
            return None;
        }
    };

    match serde_json::from_str::<StoredTokens>(&raw) {
        Ok(tokens) => {
            debug!("remember token loaded from {}", path.display());
            Some(tokens.remember_token)
        }
        Err(e) => {
            warn!("failed to parse token file {}: {e}", path.display());
            None
        }
    }
}
