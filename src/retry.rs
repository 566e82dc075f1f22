use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::duration_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay policy applied between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

impl Backoff {
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay before the next attempt, given the 1-based number of attempts
    /// already made. No jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 2u32
                    .checked_pow(attempts.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

/// What the worker does with a job whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Put it straight back into waiting
    Requeue,
    /// Park it in delayed for this long
    Delay(Duration),
    /// Attempts exhausted or error not retryable
    Fail,
}

pub(crate) fn decide(backoff: &Backoff, attempts: u32, max_attempts: u32, retryable: bool) -> RetryDecision {
    if !retryable || attempts >= max_attempts.max(1) {
        return RetryDecision::Fail;
    }
    let delay = backoff.delay_for(attempts);
    if delay.is_zero() {
        RetryDecision::Requeue
    } else {
        RetryDecision::Delay(delay)
    }
}
