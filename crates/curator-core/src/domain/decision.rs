//! Decision model: what a pipeline does with a failed attempt.
//!
//! `Decision` names the outcome (requeue or give up); `Decider` computes it
//! from the attempt context without side effects. Applying the decision
//! (saving the item, responding to the message) is the pipeline's job.

use std::time::Duration;

use super::retry::RetryPolicy;

/// What to do after an attempt that ended with errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Requeue the message and try again after `delay`.
    Requeue { delay: Duration, reason: String },

    /// Give up: mark the item failed, acknowledge the message.
    Fail { reason: String },
}

impl Decision {
    pub fn is_fail(&self) -> bool {
        matches!(self, Decision::Fail { .. })
    }
}

/// Facts about the failed attempt a decider may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based number of the attempt that just failed.
    pub attempt_number: u16,
    pub max_attempts: u16,
    /// An error that retrying cannot fix was recorded.
    pub fatal: bool,
}

/// Computes the next action for a failed attempt.
pub trait Decider: Send + Sync {
    fn decide(&self, ctx: &AttemptContext) -> Decision;
}

/// Fatal errors and exhausted attempts fail; anything else is requeued
/// with the policy's delay.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, ctx: &AttemptContext) -> Decision {
        if ctx.fatal {
            return Decision::Fail {
                reason: "Error is fatal, retry would not help".to_string(),
            };
        }
        if ctx.attempt_number >= ctx.max_attempts {
            return Decision::Fail {
                reason: format!(
                    "Max attempts reached: {}/{}",
                    ctx.attempt_number, ctx.max_attempts
                ),
            };
        }
        let delay = self.retry_policy.next_delay(ctx.attempt_number);
        Decision::Requeue {
            delay,
            reason: format!(
                "Retry attempt {}/{} after {:?}",
                ctx.attempt_number + 1,
                ctx.max_attempts,
                delay
            ),
        }
    }
}
