//! Bounded retry with exponential backoff
//!
//! Every retry in the agent goes through [`retry`]: an attempt counter, a
//! delay of `base_delay * 2^(attempt-1)` capped at `max_delay`, and an
//! optional overall deadline after which no further attempt starts.

use log::{debug, warn};
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; at least 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// No attempt starts once this much time has passed since the first
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2_u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Error returned when every attempt failed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `operation` until it succeeds or the policy is exhausted
///
/// `operation` receives the 1-based attempt number. `label` is only used
/// for log messages.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!("{} failed after {} attempts: {}", label, attempt, e);
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = policy.backoff(attempt);
                if let Some(deadline) = policy.deadline {
                    if started.elapsed() + delay >= deadline {
                        warn!(
                            "{} failed on attempt {} and the retry deadline of {:?} leaves no room for another: {}",
                            label, attempt, deadline, e
                        );
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                }

                warn!(
                    "{} failed on attempt {}/{}, retrying in {:?}: {}",
                    label, attempt, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
