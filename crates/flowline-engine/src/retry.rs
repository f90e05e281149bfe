//! Bounded re-execution of a fallible action
//!
//! Fixed wait between attempts, no jitter and no growth. The optional
//! predicate decides which errors are worth another attempt.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default wait between attempts in milliseconds
pub const DEFAULT_WAIT_MS: u64 = 500;

/// Serializable retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

impl RetryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn build<E>(&self) -> Retry<E> {
        Retry::new(self.max_attempts, self.wait())
    }
}

/// Retry policy plus the bookkeeping of its last invocation
pub struct Retry<E> {
    max_attempts: u32,
    wait: Duration,
    should_retry: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    attempts: u32,
    last_error: Option<E>,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            wait: self.wait,
            should_retry: self.should_retry.clone(),
            attempts: 0,
            last_error: None,
        }
    }
}

impl<E> std::fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("max_attempts", &self.max_attempts)
            .field("wait", &self.wait)
            .field("has_predicate", &self.should_retry.is_some())
            .field("attempts", &self.attempts)
            .field("has_last_error", &self.last_error.is_some())
            .finish()
    }
}

impl<E> Retry<E> {
    /// `max_attempts` counts the first try; zero is treated as one
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
            should_retry: None,
            attempts: 0,
            last_error: None,
        }
    }

    /// Only retry errors for which `predicate` returns true
    pub fn with_predicate(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Attempts made by the last `invoke`
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last error the last `invoke` retried past, kept whole for inspection.
    ///
    /// The error that ends an `invoke` is returned to the caller instead, so
    /// after a failure this is the one before it.
    pub fn last_error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl<E: Display> Retry<E> {
    /// Run `action` until it succeeds, the predicate rejects the error,
    /// or `max_attempts` is reached. Returns the last error in the latter cases.
    pub async fn invoke<T, F, Fut>(&mut self, mut action: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.attempts = 0;
        self.last_error = None;

        loop {
            self.attempts += 1;

            let err = match action().await {
                Ok(value) => {
                    if self.attempts > 1 {
                        debug!(attempts = self.attempts, "Action succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(err) => err,
            };

            let retryable = self.should_retry.as_ref().is_none_or(|p| p(&err));
            if !retryable || self.attempts >= self.max_attempts {
                if retryable {
                    warn!(attempts = self.attempts, error = %err, "Giving up after max attempts");
                }
                return Err(err);
            }

            warn!(
                attempt = self.attempts,
                max_attempts = self.max_attempts,
                wait_ms = self.wait.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            self.last_error = Some(err);
            tokio::time::sleep(self.wait).await;
        }
    }
}
