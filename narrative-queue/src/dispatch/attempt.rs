//! Bounded retry state machine for provider calls.
//!
//! An [`Attempt`] is passed by value and can only be advanced through
//! [`Attempt::advance`], which refuses to go past `max`. With the default
//! schedule that means one try plus at most one retry.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::{ErrorClass, ProviderError};

/// Retry timing for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Total tries including the first.
    pub max_attempts: u32,
    /// Sleep before retrying a transient failure.
    pub transient_backoff: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            transient_backoff: Duration::from_secs(10),
        }
    }
}

/// The current try of a provider call (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    number: u32,
    max: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { next: Attempt, delay: Duration },
    /// Stop. `exhausted` is set when the failure was retryable but the budget ran out.
    GiveUp { class: ErrorClass, exhausted: bool },
}

impl Attempt {
    pub fn first(schedule: &RetrySchedule) -> Self {
        Self {
            number: 1,
            max: schedule.max_attempts.max(1),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_retry(&self) -> bool {
        self.number > 1
    }

    /// Decide the follow-up for `err`. Consumes the attempt.
    pub fn advance(self, err: &ProviderError, schedule: &RetrySchedule) -> Decision {
        let class = err.class();
        if !class.is_retryable() {
            return Decision::GiveUp {
                class,
                exhausted: false,
            };
        }
        if self.number >= self.max {
            return Decision::GiveUp {
                class,
                exhausted: true,
            };
        }

        let delay = match class {
            ErrorClass::Malformed => Duration::ZERO,
            _ => schedule.transient_backoff,
        };
        Decision::Retry {
            next: Attempt {
                number: self.number + 1,
                max: self.max,
            },
            delay,
        }
    }
}

/// Final failure of a provider call.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub error: ProviderError,
    pub class: ErrorClass,
    pub attempts: u32,
    pub exhausted: bool,
}

/// Run `call` under `schedule`, appending one line per failed attempt to `trace`.
pub async fn run_attempts<T, F, Fut>(
    schedule: &RetrySchedule,
    trace: &mut Vec<String>,
    mut call: F,
) -> Result<(T, u32), AttemptFailure>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = Attempt::first(schedule);
    loop {
        let err = match call(attempt).await {
            Ok(value) => return Ok((value, attempt.number())),
            Err(err) => err,
        };

        match attempt.advance(&err, schedule) {
            Decision::Retry { next, delay } => {
                if delay.is_zero() {
                    trace.push(format!(
                        "attempt {} failed ({}): {}; retrying immediately",
                        attempt.number(),
                        err.class(),
                        err
                    ));
                } else {
                    trace.push(format!(
                        "attempt {} failed ({}): {}; retrying after {}ms backoff",
                        attempt.number(),
                        err.class(),
                        err,
                        delay.as_millis()
                    ));
                }
                debug!(attempt = attempt.number(), ?delay, "Provider call failed, retrying: {}", err);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt = next;
            }
            Decision::GiveUp { class, exhausted } => {
                let reason = if exhausted {
                    "retries exhausted"
                } else {
                    "not retryable"
                };
                trace.push(format!(
                    "attempt {} failed ({}): {}; {}",
                    attempt.number(),
                    class,
                    err,
                    reason
                ));
                warn!(attempt = attempt.number(), %class, "Provider call failed: {}", err);
                return Err(AttemptFailure {
                    error: err,
                    class,
                    attempts: attempt.number(),
                    exhausted,
                });
            }
        }
    }
}
