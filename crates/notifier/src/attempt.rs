//! Per-message dispatch state machine.
//!
//! ```text
//! Pending -> InFlight -> Acked
//!                     -> Requeued
//!                     -> DeadLettered
//! ```
//!
//! A `DispatchAttempt` is owned by the worker handling the message and is
//! dropped once it reaches a terminal state.

use std::time::Duration;

use thiserror::Error;

use gapless_common::types::{DeliveryResult, FailureReason, Notification};

use crate::dead_letter::DeadLetterKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    InFlight,
    Acked,
    Requeued,
    DeadLettered,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Requeued | Self::DeadLettered)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} a dispatch attempt in state {from:?}")]
    Illegal {
        from: AttemptState,
        action: &'static str,
    },
}

/// Retry budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of requeues after transient failures
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// What the worker must do with the queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Requeue { delay: Duration, next_attempt: u32 },
    DeadLetter { kind: DeadLetterKind, reason: String },
}

#[derive(Debug)]
pub struct DispatchAttempt {
    notification: Notification,
    attempt_count: u32,
    last_error: Option<FailureReason>,
    state: AttemptState,
}

impl DispatchAttempt {
    /// `attempt_count` is the number of retries already scheduled.
    pub fn new(notification: Notification, attempt_count: u32) -> Self {
        Self {
            notification,
            attempt_count,
            last_error: None,
            state: AttemptState::Pending,
        }
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&FailureReason> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// `Pending -> InFlight`, right before the delivery call.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        if self.state != AttemptState::Pending {
            return Err(TransitionError::Illegal {
                from: self.state,
                action: "begin",
            });
        }
        self.state = AttemptState::InFlight;
        Ok(())
    }

    /// `InFlight -> {Acked, Requeued, DeadLettered}` from a delivery result.
    pub fn complete(
        &mut self,
        result: DeliveryResult,
        policy: &RetryPolicy,
    ) -> Result<Outcome, TransitionError> {
        if self.state != AttemptState::InFlight {
            return Err(TransitionError::Illegal {
                from: self.state,
                action: "complete",
            });
        }

        let outcome = match result {
            DeliveryResult::Success => {
                self.state = AttemptState::Acked;
                Outcome::Ack
            }
            DeliveryResult::TransientFailure(reason) if self.attempt_count < policy.max_retries => {
                self.last_error = Some(reason);
                self.state = AttemptState::Requeued;
                Outcome::Requeue {
                    delay: policy.backoff(self.attempt_count),
                    next_attempt: self.attempt_count + 1,
                }
            }
            DeliveryResult::TransientFailure(reason) => {
                let detail = format!(
                    "gave up after {} retries: {reason}",
                    self.attempt_count
                );
                self.last_error = Some(reason);
                self.state = AttemptState::DeadLettered;
                Outcome::DeadLetter {
                    kind: DeadLetterKind::RetriesExhausted,
                    reason: detail,
                }
            }
            DeliveryResult::PermanentFailure(reason) => {
                let detail = reason.to_string();
                self.last_error = Some(reason);
                self.state = AttemptState::DeadLettered;
                Outcome::DeadLetter {
                    kind: DeadLetterKind::Permanent,
                    reason: detail,
                }
            }
        };

        Ok(outcome)
    }
}
