//! Fixed-interval condition polling with an overall deadline.
//!
//! The predicate is always invoked at least once. Attempts are scheduled one
//! interval apart from the start of polling, and another attempt is made only
//! if it would still start within the timeout.

use futures::FutureExt;
use log::{debug, trace};
use serde::Serialize;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ParataskConfig;
use crate::error::PollError;
use crate::invoke::{invoke, panic_message, Invocation};

/// Terminal state of a poll that did not error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Succeeded,
    TimedOut,
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollReport<T> {
    pub status: PollStatus,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_value: T,
}

impl<T> PollReport<T> {
    pub fn succeeded(&self) -> bool {
        self.status == PollStatus::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionPoller {
    timeout: Duration,
    interval: Duration,
}

impl ConditionPoller {
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self, PollError> {
        if interval.is_zero() {
            return Err(PollError::InvalidInterval);
        }
        Ok(Self { timeout, interval })
    }

    pub fn from_config(config: &ParataskConfig) -> Result<Self, PollError> {
        Self::new(config.poll_timeout(), config.poll_interval())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll until `predicate` returns `target`; `Ok(false)` on timeout
    pub fn poll<T, E, F>(&self, target: &T, predicate: F) -> Result<bool, PollError>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Result<T, E>,
        E: Into<anyhow::Error>,
    {
        Ok(self.poll_report(target, predicate)?.succeeded())
    }

    pub fn poll_true<E, F>(&self, predicate: F) -> Result<bool, PollError>
    where
        F: FnMut() -> Result<bool, E>,
        E: Into<anyhow::Error>,
    {
        self.poll(&true, predicate)
    }

    pub fn poll_report<T, E, F>(
        &self,
        target: &T,
        mut predicate: F,
    ) -> Result<PollReport<T>, PollError>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Result<T, E>,
        E: Into<anyhow::Error>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);

            let value = match invoke(&mut predicate) {
                Invocation::Returned(value) => value,
                Invocation::Raised(source) => {
                    return Err(PollError::Predicate { attempts, source });
                }
                Invocation::Panicked(message) => {
                    return Err(PollError::PredicatePanicked { attempts, message });
                }
            };

            match self.settle(target, value, attempts, started.elapsed()) {
                Step::Done(report) => return Ok(report),
                Step::Retry(delay) => thread::sleep(delay),
            }
        }
    }

    /// Async variant of [`poll_report`](Self::poll_report); sleeps on the tokio timer.
    pub async fn poll_async<T, E, F, Fut>(
        &self,
        target: &T,
        mut predicate: F,
    ) -> Result<PollReport<T>, PollError>
    where
        T: PartialEq + Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);

            let value = match AssertUnwindSafe(predicate()).catch_unwind().await {
                Ok(Ok(value)) => value,
                Ok(Err(source)) => {
                    return Err(PollError::Predicate {
                        attempts,
                        source: source.into(),
                    });
                }
                Err(payload) => {
                    return Err(PollError::PredicatePanicked {
                        attempts,
                        message: panic_message(payload.as_ref()),
                    });
                }
            };

            match self.settle(target, value, attempts, started.elapsed()) {
                Step::Done(report) => return Ok(report),
                Step::Retry(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Decide whether polling stops after an attempt.
    ///
    /// Attempt `n` is scheduled at `(n - 1) * interval` from the start, so a slow
    /// predicate eats into the sleep instead of pushing every later attempt back.
    /// An attempt that overran its slot starts immediately.
    fn settle<T>(
        &self,
        target: &T,
        value: T,
        attempts: u32,
        elapsed: Duration,
    ) -> Step<T>
    where
        T: PartialEq + Debug,
    {
        if value == *target {
            debug!("Condition reached {target:?} after {attempts} attempt(s) in {elapsed:?}");
            return Step::Done(PollReport {
                status: PollStatus::Succeeded,
                attempts,
                elapsed,
                last_value: value,
            });
        }

        let next_start = self
            .interval
            .checked_mul(attempts)
            .map(|scheduled| scheduled.max(elapsed))
            .filter(|next| *next <= self.timeout);

        let Some(next_start) = next_start else {
            debug!(
                "Condition not reached within {:?} after {attempts} attempt(s), last value {value:?}",
                self.timeout
            );
            return Step::Done(PollReport {
                status: PollStatus::TimedOut,
                attempts,
                elapsed,
                last_value: value,
            });
        };

        let delay = next_start.saturating_sub(elapsed);
        trace!("Attempt {attempts} returned {value:?}, expected {target:?}; retrying in {delay:?}");
        Step::Retry(delay)
    }
}

enum Step<T> {
    Done(PollReport<T>),
    Retry(Duration),
}

/// One-off blocking poll; see [`ConditionPoller::poll`]
pub fn poll<T, E, F>(
    predicate: F,
    target: T,
    timeout: Duration,
    interval: Duration,
) -> Result<bool, PollError>
where
    T: PartialEq + Debug,
    F: FnMut() -> Result<T, E>,
    E: Into<anyhow::Error>,
{
    ConditionPoller::new(timeout, interval)?.poll(&target, predicate)
}
