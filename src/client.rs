//! Resilient request layer for the Tastytrade REST API.
//!
//! Wraps GET/POST/PUT/DELETE with:
//! - Session headers built per attempt (a cleared token is observed immediately)
//! - Status classification through the error taxonomy
//! - Exponential-backoff retry for the retryable kinds

use crate::errors::{ApiError, Result};
use crate::session::SessionManager;
use reqwest::Method;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Timeout applied to every request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry configuration: attempt count and backoff shape.
///
/// Only error kinds reporting `is_retryable()` wait and retry; everything
/// else propagates on first occurrence with zero wait.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (always at least 1)
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied to the wait per subsequent attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Wait before attempt `attempt + 1`: `base * multiplier^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32))
    }
}

/// Run an operation under a retry policy.
///
/// Retryable failures wait and re-attempt up to `max_attempts`; the final
/// failure propagates unchanged. Non-retryable failures propagate
/// immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> std::result::Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "attempt {attempt}/{} failed: {e}; retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    error!("giving up after {attempt} attempts: {e}");
                }
                return Err(e);
            }
        }
    }
}

/// HTTP client for the upstream REST API.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    session: Arc<SessionManager>,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Create a client sharing the given session.
    pub fn new(session: Arc<SessionManager>, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into(),
            http,
            session,
            retry,
        }
    }

    /// GET with optional query parameters.
    pub async fn get(&self, endpoint: &str, params: Option<&[(&str, &str)]>) -> Result<Value> {
        with_retry(&self.retry, || {
            self.request(Method::GET, endpoint, None, params)
        })
        .await
        .map_err(Into::into)
    }

    /// POST with an optional JSON body.
    pub async fn post(&self, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        with_retry(&self.retry, || {
            self.request(Method::POST, endpoint, body, None)
        })
        .await
        .map_err(Into::into)
    }

    /// PUT with an optional JSON body.
    pub async fn put(&self, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        with_retry(&self.retry, || self.request(Method::PUT, endpoint, body, None))
            .await
            .map_err(Into::into)
    }

    /// DELETE with an optional JSON body. A 204 response yields an empty
    /// object, not an error.
    pub async fn delete(&self, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        with_retry(&self.retry, || {
            self.request(Method::DELETE, endpoint, body, None)
        })
        .await
        .map_err(Into::into)
    }

    /// One request attempt. Non-2xx statuses route through the session's
    /// error handler (which clears the token on 401); connection-level
    /// faults wrap into a transport error carrying the URL and are not
    /// retried here.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        params: Option<&[(&str, &str)]>,
    ) -> std::result::Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("{method} {url}");

        let mut request = self
            .http
            .request(method, &url)
            .headers(self.session.headers());
        if let Some(params) = params {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;

        let status = response.status().as_u16();
        match status {
            200 => response
                .json::<Value>()
                .await
                .map_err(|e| ApiError::transport(&url, e)),
            204 => Ok(Value::Object(serde_json::Map::new())),
            _ => {
                warn!("unexpected status code: {status}");
                let body = response.text().await.unwrap_or_default();
                Err(self.session.handle_error(status, &body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ENVELOPE: &str = r#"{"error":{"code":"throttled","message":"slow down"}}"#;

    #[test]
    fn delay_schedule_is_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), 2.0);
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_calls_retry_with_strictly_increasing_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0);
        let attempts = AtomicU32::new(0);
        let call_times = Mutex::new(Vec::new());

        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), ApiError> = with_retry(&policy, || {
            call_times.lock().push(tokio::time::Instant::now());
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::classify(429, ENVELOPE)) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::TooManyRequests(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let call_times = call_times.lock();
        let first_gap = call_times[1] - call_times[0];
        let second_gap = call_times[2] - call_times[1];
        assert_eq!(first_gap, Duration::from_millis(100));
        assert_eq!(second_gap, Duration::from_millis(200));
        assert!(second_gap > first_gap);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_until_attempts_are_exhausted() {
        let policy = RetryPolicy::new(4, Duration::from_millis(50), 2.0);
        let attempts = AtomicU32::new(0);

        let result: std::result::Result<(), ApiError> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::classify(500, ENVELOPE)) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Server { status: 500, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_requests_are_never_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0);
        let attempts = AtomicU32::new(0);

        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), ApiError> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::classify(400, ENVELOPE)) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failures_passes_through() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0);
        let attempts = AtomicU32::new(0);

        let result = with_retry(&policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(ApiError::classify(429, ENVELOPE))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
