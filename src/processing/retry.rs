//! Bounded retry with a fixed backoff interval.
//!
//! [`RetryMachine`] owns the attempt bound as an explicit state machine so that it can be
//! exercised without any I/O; [`run_with_retry`] drives it around an async operation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::annotation::ServiceError;

/// Attempt bound and backoff for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Build a policy; a zero attempt count is raised to one.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Total attempts allowed, first call included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait between a transient failure and the next attempt.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Where a [`RetryMachine`] currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No attempt issued yet.
    Ready,
    /// An attempt is running.
    InFlight,
    /// Backing off before the next attempt.
    Waiting,
    /// No further attempts will be issued.
    Finished,
}

/// Decision taken after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait this long, then start the next attempt.
    Backoff(Duration),
    /// The attempt bound is reached.
    GiveUp,
}

/// Attempt counter with explicit transitions.
///
/// `Ready → InFlight → (Waiting → InFlight)* → Finished`; attempts never overlap.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    attempts: u32,
    state: RetryState,
}

impl RetryMachine {
    /// Fresh machine for one chunk.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            state: RetryState::Ready,
        }
    }

    /// Current state.
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Begin the next attempt, returning its 1-based number.
    ///
    /// Returns `None` while an attempt is in flight or once the machine has finished.
    pub fn start_attempt(&mut self) -> Option<u32> {
        match self.state {
            RetryState::Ready | RetryState::Waiting => {
                self.attempts += 1;
                self.state = RetryState::InFlight;
                Some(self.attempts)
            }
            RetryState::InFlight | RetryState::Finished => None,
        }
    }

    /// Record a transient failure of the in-flight attempt.
    pub fn on_transient_failure(&mut self) -> RetryStep {
        if self.state == RetryState::InFlight && self.attempts < self.policy.max_attempts {
            self.state = RetryState::Waiting;
            RetryStep::Backoff(self.policy.interval)
        } else {
            self.state = RetryState::Finished;
            RetryStep::GiveUp
        }
    }

    /// Record success or a non-retryable failure.
    pub fn finish(&mut self) {
        self.state = RetryState::Finished;
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The service returned a non-retryable error.
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    Fatal {
        /// Attempts issued, the failing one included.
        attempts: u32,
        /// Error returned by the service.
        #[source]
        source: ServiceError,
    },
    /// Every allowed attempt failed transiently.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts issued.
        attempts: u32,
        /// Error returned by the last attempt.
        #[source]
        source: ServiceError,
    },
}

impl RetryError {
    /// Attempts issued before the failure surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Successful value together with the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Value returned by the successful attempt.
    pub value: T,
    /// Attempts issued, the successful one included.
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails fatally, or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. Attempts run strictly one after another.
pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut machine = RetryMachine::new(policy);

    while let Some(attempt) = machine.start_attempt() {
        let error = match operation(attempt).await {
            Ok(value) => {
                machine.finish();
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            machine.finish();
            return Err(RetryError::Fatal {
                attempts: attempt,
                source: error,
            });
        }

        match machine.on_transient_failure() {
            RetryStep::Backoff(delay) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient annotation failure; backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            RetryStep::GiveUp => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }
        }
    }

    unreachable!("retry machine always finishes through success, fatal error or give-up")
}
