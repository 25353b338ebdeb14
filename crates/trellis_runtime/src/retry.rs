//! Per-node retry with jittered delay.
//!
//! The policy is stateless: every node execution counts its own attempts.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use trellis_config::RetryConfig;
use trellis_core::{ANY_ERROR, NodeError, SerializationError};

/// Failure of a single attempt
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError {
    /// The callable reported an error
    #[error(transparent)]
    Node(#[from] NodeError),
    /// A value could not be encoded or decoded; never retried
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl AttemptError {
    /// Classifier matched against `retry_exceptions`, if retryable at all
    #[must_use]
    pub fn classifier(&self) -> Option<&str> {
        match self {
            Self::Node(err) => Some(&err.kind),
            Self::Serialization(_) => None,
        }
    }
}

/// Retry settings resolved for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_delay: Duration,
    /// Relative jitter, in `[0, 1)`
    pub jitter_factor: f64,
    /// Classifiers that trigger a retry
    pub retry_exceptions: Vec<String>,
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
            retry_exceptions: Vec::new(),
        }
    }

    /// Whether `error` is eligible for a retry
    #[must_use]
    pub fn matches(&self, error: &AttemptError) -> bool {
        match error.classifier() {
            Some(kind) => self
                .retry_exceptions
                .iter()
                .any(|c| c == ANY_ERROR || c == kind),
            None => false,
        }
    }

    /// Sample the delay before the next attempt
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay_with(&mut rand::thread_rng())
    }

    /// Sample the delay with a caller-provided generator.
    ///
    /// The result lies in `[delay * (1 - j), delay * (1 + j)]`; with
    /// `j = 0` it is exactly `delay`.
    pub fn delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.retry_delay;
        }
        let j = self.jitter_factor;
        self.retry_delay.mul_f64(1.0 + rng.gen_range(-j..=j))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs_f64(config.retry_delay),
            jitter_factor: config.jitter_factor,
            retry_exceptions: config.retry_exceptions.clone(),
        }
    }
}

/// Result of a retried execution plus the number of attempts made
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    /// Value, or the last attempt's error
    pub result: Result<T, AttemptError>,
    /// Attempts made, at least one
    pub attempts: u32,
}

/// Run `attempt` until it succeeds, fails with an error the policy does
/// not match, or `max_retries` retries have been made.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    node: &str,
    mut attempt: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match attempt().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(error) => error,
        };

        if attempts > policy.max_retries || !policy.matches(&error) {
            return Attempted {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay();
        tracing::warn!(
            node,
            attempt = attempts,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Node attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
