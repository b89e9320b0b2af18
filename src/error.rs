use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a single task in a group did not produce a value
#[derive(Debug, Clone, Error)]
pub enum TaskFailure {
    #[error("Task raised an error: {0:#}")]
    Raised(Arc<anyhow::Error>),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn task thread: {0}")]
    Spawn(String),
}

impl TaskFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskFailure::Timeout(_))
    }

    /// The error a callable returned, if that is why it failed
    pub fn raised(&self) -> Option<&anyhow::Error> {
        match self {
            TaskFailure::Raised(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Short classification used in reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            TaskFailure::Raised(_) => "TaskFailure",
            TaskFailure::Panicked(_) => "TaskPanic",
            TaskFailure::Timeout(_) => "TaskTimeout",
            TaskFailure::Spawn(_) => "SpawnError",
        }
    }
}

/// Errors surfaced by the condition poller
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Predicate failed on attempt {attempts}: {source:#}")]
    Predicate {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Predicate panicked on attempt {attempts}: {message}")]
    PredicatePanicked { attempts: u32, message: String },

    #[error("Poll interval must be greater than zero")]
    InvalidInterval,
}

/// API misuse: calling task group operations out of sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidStateError {
    #[error("Task group has already been started")]
    AlreadyStarted,

    #[error("Task group has not been started")]
    NotStarted,

    #[error("Task group has not finished yet")]
    NotFinished,
}
