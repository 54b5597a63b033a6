//! Fail-open and bounded-retry utilities for channel I/O
//!
//! Channel operations fail in two ways: transient errors (throttling,
//! network blips) that are worth retrying, and everything else. These
//! helpers keep retries inside a caller-supplied budget so that no stage of
//! routing blocks past its own timeout.
//!
//! DO NOT use fail-open for:
//! - Posting the assignment decision (use [`retry_attempts`] and surface the error)
//! - Anything whose failure changes the routing decision silently

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RetryConfig;
use crate::Result;

/// Execute an operation whose failure should be logged and then ignored
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use parley_core::fail_open::fail_open;
/// use parley_core::Result;
///
/// async fn post_prompt() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let posted = fail_open("discussion_prompt", || post_prompt()).await;
///     // posted is None if post_prompt() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial_backoff(), config.max_backoff())
    }

    /// Delay to wait before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Retry transient failures until `deadline`
///
/// Non-transient errors are returned immediately. When the deadline passes
/// the most recent error is returned; sleeps never overshoot the deadline.
pub async fn retry_until<F, Fut, T>(
    operation_name: &str,
    deadline: Instant,
    mut backoff: Backoff,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        "{} failed after {} attempts, budget exhausted: {}",
                        operation_name, attempt, e
                    );
                    return Err(e);
                }
                let delay = backoff.next_delay().min(deadline - now);
                warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    operation_name, attempt, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry any failure up to `max_attempts` times with backoff between attempts
pub async fn retry_attempts<F, Fut, T>(
    operation_name: &str,
    max_attempts: u32,
    mut backoff: Backoff,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation_name, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name, attempt, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
