//! Retry-with-delay for outbound calls.
//!
//! Every call the harness makes to an external collaborator (source
//! store fetches, blob uploads, HTTP requests from unit code) goes
//! through [`retry_async`] or its HTTP variant [`send_with_retry`].
//!
//! # Behavior
//!
//! - Attempts run strictly one after another; the next starts only after
//!   the previous one has been fully awaited.
//! - The delay between attempts is constant ([`RetryPolicy::delay`]).
//! - Each failed attempt is logged with its number, latency, and error.
//!   The first failure logs at `debug`, later ones at `warn`.
//! - With a deadline, an attempt still running at the deadline is
//!   abandoned and no further attempts start once it has passed.
//! - When every attempt fails, a single [`RetryError`] carries all of the
//!   attempt errors, oldest first.
//!
//! # HTTP
//!
//! [`send_with_retry`] retries only while the overall elapsed time is
//! under the client timeout *and* the failure is a transient network
//! error or `503 Service Unavailable`. Any other non-success status fails
//! immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetryConfig;

// ═══════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════

/// How many times to try, how long to wait in between, and an optional
/// caller deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub deadline: Option<Instant>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            deadline: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.delay_ms))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Error
// ═══════════════════════════════════════════════════════════════════════

/// Every attempt of an operation failed.
#[derive(Debug)]
pub struct RetryError {
    pub operation: String,
    /// One error per attempt made, oldest first.
    pub attempts: Vec<anyhow::Error>,
}

impl RetryError {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn last(&self) -> Option<&anyhow::Error> {
        self.attempts.last()
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s)",
            self.operation,
            self.attempts.len()
        )?;
        if let Some(last) = self.attempts.last() {
            write!(f, ": {:#}", last)?;
        }
        Ok(())
    }
}

impl std::error::Error for RetryError {}

// ═══════════════════════════════════════════════════════════════════════
// Generic retry
// ═══════════════════════════════════════════════════════════════════════

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `operation` names the call in logs and in the returned error.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let request_id = Uuid::new_v4();
    let attempts = policy.attempts();
    let mut errors = Vec::new();

    for attempt in 1..=attempts {
        let started = Instant::now();
        let outcome = match policy.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("deadline elapsed during attempt")),
            },
            None => op().await,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(%request_id, operation, attempt, latency_ms, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                log_attempt(request_id, operation, attempt, latency_ms, &err);
                errors.push(err);
            }
        }

        if attempt == attempts || policy.deadline_passed() {
            break;
        }
        match policy.deadline {
            Some(deadline) if Instant::now() + policy.delay >= deadline => break,
            _ => tokio::time::sleep(policy.delay).await,
        }
    }

    Err(RetryError {
        operation: operation.to_string(),
        attempts: errors,
    })
}

fn log_attempt(request_id: Uuid, operation: &str, attempt: u32, latency_ms: u64, err: &anyhow::Error) {
    let root_cause = err.root_cause().to_string();
    if attempt == 1 {
        debug!(%request_id, operation, attempt, latency_ms, error = %err, %root_cause, "attempt failed");
    } else {
        warn!(%request_id, operation, attempt, latency_ms, error = %err, %root_cause, "retry attempt failed");
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP retry
// ═══════════════════════════════════════════════════════════════════════

/// What to do with the outcome of one HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerdict {
    Success,
    Retry,
    Fail,
}

/// Classify a response status: success passes, 503 is retryable,
/// anything else fails immediately.
pub fn classify_status(status: reqwest::StatusCode) -> HttpVerdict {
    if status.is_success() {
        HttpVerdict::Success
    } else if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        HttpVerdict::Retry
    } else {
        HttpVerdict::Fail
    }
}

/// Whether a transport error is worth retrying.
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Send the request built by `build` with HTTP-aware retries.
///
/// `build` is called once per attempt. `client_timeout` bounds the total
/// time spent retrying; an attempt that fails after it has elapsed is the
/// last one.
/// A request still in flight at the policy deadline is abandoned.
pub async fn send_with_retry<B>(
    policy: &RetryPolicy,
    client_timeout: Duration,
    operation: &str,
    build: B,
) -> Result<reqwest::Response, RetryError>
where
    B: Fn() -> reqwest::RequestBuilder,
{
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let attempts = policy.attempts();
    let mut errors = Vec::new();

    for attempt in 1..=attempts {
        let attempt_started = Instant::now();
        let sent = match policy.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, build().send()).await.ok(),
            None => Some(build().send().await),
        };
        let retryable = match sent {
            None => {
                errors.push(anyhow::anyhow!("{} deadline elapsed during attempt", operation));
                false
            }
            Some(Ok(response)) => match classify_status(response.status()) {
                HttpVerdict::Success => return Ok(response),
                verdict => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    errors.push(anyhow::anyhow!("{} returned {}: {}", operation, status, body));
                    verdict == HttpVerdict::Retry
                }
            },
            Some(Err(e)) => {
                let transient = is_transient(&e);
                errors.push(anyhow::Error::new(e).context(format!("{} request failed", operation)));
                transient
            }
        };

        let latency_ms = attempt_started.elapsed().as_millis() as u64;
        if let Some(err) = errors.last() {
            log_attempt(request_id, operation, attempt, latency_ms, err);
        }

        if !retryable
            || attempt == attempts
            || started.elapsed() >= client_timeout
            || policy.deadline_passed()
        {
            break;
        }
        tokio::time::sleep(policy.delay).await;
    }

    Err(RetryError {
        operation: operation.to_string(),
        attempts: errors,
    })
}
