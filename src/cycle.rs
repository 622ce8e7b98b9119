//! Explicit state machine for the repeating protocol loops.
//!
//! Each protocol task moves through
//! `Idle -> Sending -> Awaiting -> (Idle via Sleeping)`, with `TimedOut`
//! recorded when the awaited answer never came. [`Cycle::finish`] decides
//! how long to sleep: the regular interval after a completed or timed-out
//! iteration, the backoff after a failure.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    Awaiting,
    TimedOut,
    Sleeping,
}

/// How one iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Cycle {
    phase: Phase,
    interval: Duration,
    backoff: Duration,
    iterations: u64,
    timeouts: u64,
    failures: u64,
}

impl Cycle {
    pub fn new(interval: Duration, backoff: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            interval,
            backoff,
            iterations: 0,
            timeouts: 0,
            failures: 0,
        }
    }

    /// A cycle whose failures wait the same as successes.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn transition(&mut self, allowed: &[Phase], to: Phase) {
        debug_assert!(
            allowed.contains(&self.phase),
            "invalid cycle transition {:?} -> {:?}",
            self.phase,
            to
        );
        self.phase = to;
    }

    /// Idle -> Sending.
    pub fn begin(&mut self) {
        self.transition(&[Phase::Idle], Phase::Sending);
        self.iterations += 1;
    }

    /// Sending -> Awaiting.
    pub fn sent(&mut self) {
        self.transition(&[Phase::Sending], Phase::Awaiting);
    }

    /// Ends the iteration and returns how long to sleep before the next one.
    ///
    /// Only an iteration that reached `Awaiting` can complete or time out;
    /// a failure can happen in either active phase.
    pub fn finish(&mut self, outcome: Outcome) -> Duration {
        let active = [Phase::Sending, Phase::Awaiting];
        match outcome {
            Outcome::Completed => {
                self.transition(&[Phase::Awaiting], Phase::Sleeping);
                self.interval
            }
            Outcome::TimedOut => {
                self.transition(&[Phase::Awaiting], Phase::TimedOut);
                self.timeouts += 1;
                self.transition(&[Phase::TimedOut], Phase::Sleeping);
                self.interval
            }
            Outcome::Failed => {
                self.transition(&active, Phase::Sleeping);
                self.failures += 1;
                self.backoff
            }
        }
    }

    /// Sleeping -> Idle.
    pub fn wake(&mut self) {
        self.transition(&[Phase::Sleeping], Phase::Idle);
    }
}

/// Sleeps for `delay`. Returns false if `cancel` fired first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
