// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! Two callers: connection setup for the SQL store, and transactions that
//! lose an optimistic-lock race at commit time and must be re-run from a
//! fresh snapshot.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tenant_sync::RetryConfig;
//!
//! let tx = RetryConfig::transaction(4);
//! let delays: Vec<Duration> = tx.backoff().collect();
//! assert_eq!(delays.len(), 3); // sleeps between 4 attempts
//! assert!(delays.windows(2).all(|w| w[0] <= w[1]));
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently to re-run a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Never below 1.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::transaction(10)
    }
}

impl RetryConfig {
    /// Connection setup: a handful of attempts over a few seconds, so a bad
    /// URL fails startup instead of hanging it.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Commit-conflict retry. Conflicts clear quickly, so delays stay small.
    #[must_use]
    pub fn transaction(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// The sleeps between consecutive attempts: one fewer than
    /// `max_attempts`, growing by `factor` up to `max_delay`.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            factor: self.factor,
            remaining: self.max_attempts.max(1) - 1,
        }
    }
}

/// Iterator over backoff delays, see [`RetryConfig::backoff`].
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    remaining: usize,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        self.next = self.next.mul_f64(self.factor).min(self.max);
        Some(current)
    }
}

/// Re-run `operation` on any failure until the attempts run out.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Re-run `operation` while it fails with errors `should_retry` accepts.
/// Other errors, and the last retryable one, are returned as they are.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = config.backoff();
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        let Some(delay) = backoff.next() else {
            warn!(operation = operation_name, attempts = attempt, error = %err, "Giving up");
            return Err(err);
        };

        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
