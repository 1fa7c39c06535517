use crate::backoff::Backoff;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Decision returned by the retry policy after a failed external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay` (includes 1-based attempt number).
    Retry { attempt: u32, delay: Duration },
    /// Failures reached the degraded threshold. Retrying continues after `delay`;
    /// `newly` is true only on the failure that crossed the threshold.
    Degraded {
        attempt: u32,
        delay: Duration,
        newly: bool,
    },
}

impl RetryDecision {
    pub fn delay(&self) -> Duration {
        match self {
            RetryDecision::Retry { delay, .. } | RetryDecision::Degraded { delay, .. } => *delay,
        }
    }
}

/// Retry policy for one class of recoverable failure (auth or fetch).
///
/// Never gives up: the loop keeps running. After `degraded_after` consecutive
/// failures the status turns degraded, one error is logged, and further failures
/// log at debug so a long outage cannot grow the log without bound.
pub struct RetryPolicy {
    label: &'static str,
    backoff: Backoff,
    degraded_after: u32,
    failures: u32,
}

impl RetryPolicy {
    pub fn new(label: &'static str, backoff: Backoff, degraded_after: u32) -> Self {
        Self {
            label,
            backoff,
            degraded_after: degraded_after.max(1),
            failures: 0,
        }
    }

    /// Record a failure and decide how long to wait.
    pub fn on_failure(&mut self, err: &dyn Display) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff.next_delay();
        let attempt = self.failures;

        if attempt < self.degraded_after {
            warn!(
                kind = self.label,
                error = %err,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "external call failed, retrying"
            );
            return RetryDecision::Retry { attempt, delay };
        }

        let newly = attempt == self.degraded_after;
        if newly {
            error!(
                kind = self.label,
                error = %err,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "consecutive failures reached degraded threshold, still retrying"
            );
        } else {
            debug!(
                kind = self.label,
                error = %err,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "external call still failing"
            );
        }
        RetryDecision::Degraded {
            attempt,
            delay,
            newly,
        }
    }

    /// Reset after a success. Returns true if the policy was degraded.
    pub fn on_success(&mut self) -> bool {
        let was_degraded = self.is_degraded();
        if was_degraded {
            info!(kind = self.label, failures = self.failures, "external call recovered");
        }
        self.failures = 0;
        self.backoff.reset();
        was_degraded
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_degraded(&self) -> bool {
        self.failures >= self.degraded_after
    }
}
