//! Retry logic with exponential backoff
//!
//! Two layers of the pipeline retry failed work: the API client retries request
//! timeouts, and the orchestrator retries a whole data fetch. Both use the
//! executor in this module. Backoff sleeps race against an optional
//! [`CancellationToken`], and since they are plain futures, dropping the retry
//! future (for example when an enclosing `tokio::time::timeout` expires) aborts a
//! pending sleep immediately.
//!
//! # Example
//!
//! ```no_run
//! use tgraph::retry::{IsRetryable, retry_with_backoff};
//! use tgraph::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # impl From<tgraph::Error> for MyError {
//! #     fn from(_: tgraph::Error) -> Self {
//! #         MyError::Permanent
//! #     }
//! # }
//! #
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = retry_with_backoff(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, dropped connections) should return `true`.
/// Business errors and malformed data should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Classification used by the orchestrator's fetch retry.
///
/// The API client applies a narrower rule of its own (timeouts only).
impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Server rejections and local faults
            Error::Api { .. } => false,
            Error::Format(_) => false,
            Error::Validation(_) => false,
            Error::Config { .. } => false,
            Error::Pipeline { .. } => false,
            Error::Timeout { .. } => false,
            Error::Cancelled => false,
            Error::Serialization(_) => false,
            Error::Yaml(_) => false,
            Error::FileWatch(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Details of a failed attempt that is about to be retried
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Zero-based index of the attempt that failed
    pub attempt: u32,
    /// Total number of retries allowed after the first attempt
    pub max_retries: u32,
    /// Delay before the next attempt
    pub delay: Duration,
    /// The failure that triggered the retry
    pub error: &'a E,
}

/// Execute an async operation with exponential backoff retry logic
///
/// Retries errors whose [`IsRetryable::is_retryable`] returns `true`, up to
/// `config.max_retries` additional attempts.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display + From<Error>,
{
    retry_when(config, None, |e: &E| e.is_retryable(), |_| {}, operation).await
}

/// Execute an async operation with a custom retry predicate, a retry observer and an
/// optional cancellation token
///
/// * `should_retry` decides whether a failure is worth another attempt
/// * `on_retry` is invoked before each backoff sleep (used to record warnings)
/// * `cancel`, when triggered during a backoff sleep, aborts the loop with
///   [`Error::Cancelled`]
///
/// The delay before retry `n` (0-based) is `initial_delay * backoff_multiplier^n`,
/// capped at `max_delay` when one is configured.
pub async fn retry_when<F, Fut, T, E, P, H>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    mut should_retry: P,
    mut on_retry: H,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + From<Error>,
    P: FnMut(&E) -> bool,
    H: FnMut(&RetryAttempt<'_, E>),
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt < config.max_retries && should_retry(&e) => {
                let delay = if config.jitter {
                    add_jitter(config.delay_for(attempt))
                } else {
                    config.delay_for(attempt)
                };

                tracing::warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                on_retry(&RetryAttempt {
                    attempt,
                    max_retries: config.max_retries,
                    delay,
                    error: &e,
                });

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {
                                tracing::debug!("Retry backoff cancelled");
                                return Err(E::from(Error::Cancelled));
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }

                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
