//! Workflow-scoped cancellation and deadline

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::state::WorkflowFailure;

/// Why an in-flight await was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Cancellation signal and global deadline shared by every suspension point
/// of one workflow run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    started: Instant,
    deadline: Instant,
}

/// Stand-in deadline when `started + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl ExecutionContext {
    /// Context whose deadline runs from now
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self::starting_at(Instant::now(), timeout, cancel)
    }

    /// Context whose deadline runs from `started`, which may lie in the past
    pub fn starting_at(started: Instant, timeout: Duration, cancel: CancellationToken) -> Self {
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        Self {
            cancel,
            started,
            deadline,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Current interrupt, if any; cancellation wins over the deadline
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.is_timed_out() {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }

    /// Resolves once the workflow is cancelled or its deadline passes
    pub async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Interrupt::TimedOut,
        }
    }

    /// Drive `fut` to completion unless the workflow is interrupted first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            output = fut => Ok(output),
        }
    }

    /// Interruptible sleep
    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupt> {
        if delay.is_zero() {
            return match self.interrupt() {
                Some(interrupt) => Err(interrupt),
                None => Ok(()),
            };
        }
        self.guard(tokio::time::sleep(delay)).await
    }

    /// Workflow failure for an interrupt observed now
    pub fn failure(&self, interrupt: Interrupt) -> WorkflowFailure {
        match interrupt {
            Interrupt::Cancelled => WorkflowFailure::cancelled(),
            Interrupt::TimedOut => WorkflowFailure::timeout(self.elapsed()),
        }
    }
}
