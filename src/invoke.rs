//! Invoke an opaque callable and capture what it produced.
//!
//! Both the task group and the condition poller go through [`invoke`], so a
//! callable that returns an error and a callable that panics are reported the
//! same way everywhere.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Result type produced by task and predicate callables
pub type TaskResult<T> = Result<T, anyhow::Error>;

/// What a single invocation produced
#[derive(Debug)]
pub enum Invocation<T> {
    Returned(T),
    Raised(anyhow::Error),
    Panicked(String),
}

impl<T> Invocation<T> {
    pub fn is_returned(&self) -> bool {
        matches!(self, Invocation::Returned(_))
    }

    /// Collapse into a plain result, turning a panic into an error
    pub fn into_result(self) -> TaskResult<T> {
        match self {
            Invocation::Returned(value) => Ok(value),
            Invocation::Raised(err) => Err(err),
            Invocation::Panicked(message) => Err(anyhow::anyhow!("panicked: {message}")),
        }
    }
}

/// Call `f`, catching both returned errors and panics
pub fn invoke<T, E, F>(f: F) -> Invocation<T>
where
    F: FnOnce() -> Result<T, E>,
    E: Into<anyhow::Error>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Invocation::Returned(value),
        Ok(Err(err)) => Invocation::Raised(err.into()),
        Err(payload) => Invocation::Panicked(panic_message(payload.as_ref())),
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
