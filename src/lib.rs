//! # paratask
//!
//! Concurrency helpers for test automation: run independent operations in
//! parallel under one deadline, and poll a condition until it converges.
//!
//! ```no_run
//! use paratask::{ConditionPoller, TaskGroup};
//! use std::time::Duration;
//!
//! let mut group: TaskGroup<bool> = TaskGroup::with_name("migrations");
//! for vm in ["vm-1", "vm-2"] {
//!     group.add_check(move || -> anyhow::Result<bool> { Ok(!vm.is_empty()) })?;
//! }
//! let result = group.run_and_wait(Duration::from_secs(600))?;
//! assert!(result.overall_success);
//!
//! let poller = ConditionPoller::new(Duration::from_secs(60), Duration::from_secs(1))?;
//! let converged = poller.poll_true(|| -> anyhow::Result<bool> { Ok(true) })?;
//! assert!(converged);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod invoke;
pub mod poller;
pub mod task_group;

pub use config::{create_sample_config, load_config, ParataskConfig};
pub use error::{InvalidStateError, PollError, TaskFailure};
pub use invoke::{invoke, Invocation, TaskResult};
pub use poller::{poll, ConditionPoller, PollReport, PollStatus};
pub use task_group::{
    OutcomeStatus, TaskGroup, TaskGroupResult, TaskGroupSummary, TaskOutcome, TaskSummary,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
