//! Run independent callables in parallel under one shared deadline.
//!
//! Each task gets its own OS thread. Finished tasks report back over a
//! completion channel, and the group waits on that channel until every task
//! has reported or the deadline passes. Tasks still running at the deadline
//! are left alone and recorded as timed out.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt::{self, Debug};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::ParataskConfig;
use crate::error::{InvalidStateError, TaskFailure};
use crate::invoke::{invoke, Invocation};

type BoxedJob<T> = Box<dyn FnOnce() -> Invocation<T> + Send + 'static>;

struct PendingTask<T> {
    label: String,
    expected: T,
    job: BoxedJob<T>,
}

#[derive(Debug)]
struct TaskCompletion<T> {
    index: usize,
    invocation: Invocation<T>,
    elapsed: Duration,
}

struct TaskSlot<T> {
    label: String,
    expected: T,
    result: Option<Result<T, TaskFailure>>,
    elapsed: Option<Duration>,
}

struct RunningTasks<T> {
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    deadline: Option<Instant>,
    slots: Vec<TaskSlot<T>>,
    completion_receiver: mpsc::Receiver<TaskCompletion<T>>,
}

enum GroupState<T> {
    Open(Vec<PendingTask<T>>),
    Running(RunningTasks<T>),
    Finished(TaskGroupResult<T>),
}

/// How a single task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Matched,
    Mismatched,
    Failed,
    TimedOut,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Mismatched => write!(f, "mismatched"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Terminal record for one task, indexed by submission order
#[derive(Debug, Clone)]
pub struct TaskOutcome<T> {
    pub index: usize,
    pub label: String,
    pub expected: T,
    pub returned: Option<T>,
    pub failure: Option<TaskFailure>,
    /// Wall time of the callable; absent when the group stopped waiting first
    pub elapsed: Option<Duration>,
}

impl<T: PartialEq> TaskOutcome<T> {
    pub fn matched_expected(&self) -> bool {
        self.failure.is_none() && self.returned.as_ref() == Some(&self.expected)
    }

    pub fn status(&self) -> OutcomeStatus {
        match &self.failure {
            Some(failure) if failure.is_timeout() => OutcomeStatus::TimedOut,
            Some(_) => OutcomeStatus::Failed,
            None if self.matched_expected() => OutcomeStatus::Matched,
            None => OutcomeStatus::Mismatched,
        }
    }
}

/// Aggregate over every task of one run
#[derive(Debug, Clone)]
pub struct TaskGroupResult<T> {
    pub group_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcomes: Vec<TaskOutcome<T>>,
    pub overall_success: bool,
}

impl<T: PartialEq + Debug> TaskGroupResult<T> {
    pub fn outcome(&self, index: usize) -> Option<&TaskOutcome<T>> {
        self.outcomes.get(index)
    }

    /// Outcomes that did not match their expected value, for any reason
    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome<T>> {
        self.outcomes.iter().filter(|outcome| !outcome.matched_expected())
    }

    pub fn summary(&self) -> TaskGroupSummary {
        let mut summary = TaskGroupSummary {
            group_id: self.group_id,
            started_at: self.started_at,
            elapsed_ms: duration_millis(self.elapsed),
            overall_success: self.overall_success,
            total: self.outcomes.len(),
            matched: 0,
            mismatched: 0,
            failed: 0,
            timed_out: 0,
            tasks: Vec::with_capacity(self.outcomes.len()),
        };

        for outcome in &self.outcomes {
            let status = outcome.status();
            match status {
                OutcomeStatus::Matched => summary.matched += 1,
                OutcomeStatus::Mismatched => summary.mismatched += 1,
                OutcomeStatus::Failed => summary.failed += 1,
                OutcomeStatus::TimedOut => summary.timed_out += 1,
            }

            summary.tasks.push(TaskSummary {
                index: outcome.index,
                label: outcome.label.clone(),
                status,
                elapsed_ms: outcome.elapsed.map(duration_millis),
                expected: format!("{:?}", outcome.expected),
                returned: outcome.returned.as_ref().map(|value| format!("{value:?}")),
                failure: outcome.failure.as_ref().map(|failure| failure.to_string()),
            });
        }

        summary
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable view of a [`TaskGroupResult`]
#[derive(Debug, Clone, Serialize)]
pub struct TaskGroupSummary {
    pub group_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub overall_success: bool,
    pub total: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub index: usize,
    pub label: String,
    pub status: OutcomeStatus,
    pub elapsed_ms: Option<u64>,
    pub expected: String,
    pub returned: Option<String>,
    pub failure: Option<String>,
}

/// A fixed set of tasks executed concurrently under one deadline.
///
/// Tasks are registered with [`add`](Self::add) and run with
/// [`run_and_wait`](Self::run_and_wait). A group runs once. Dropping a group
/// that was started but never waited on waits for it before returning, so no
/// started group goes unjoined.
pub struct TaskGroup<T> {
    id: Uuid,
    name: String,
    thread_prefix: String,
    state: GroupState<T>,
}

impl<T> TaskGroup<T> {
    pub fn new() -> Self {
        Self::with_name("task-group")
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            thread_prefix: "paratask".to_string(),
            state: GroupState::Open(Vec::new()),
        }
    }

    pub fn from_config(name: &str, config: &ParataskConfig) -> Self {
        Self::with_name(name).with_thread_prefix(&config.thread_name_prefix)
    }

    /// Prefix for the names of the threads that run this group's tasks
    pub fn with_thread_prefix(mut self, prefix: &str) -> Self {
        self.thread_prefix = prefix.replace('\0', "");
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        match &self.state {
            GroupState::Open(tasks) => tasks.len(),
            GroupState::Running(running) => running.slots.len(),
            GroupState::Finished(result) => result.outcomes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, GroupState::Open(_))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, GroupState::Finished(_))
    }

    /// Return the result of the completed run
    pub fn result(&self) -> Result<&TaskGroupResult<T>, InvalidStateError> {
        match &self.state {
            GroupState::Finished(result) => Ok(result),
            GroupState::Running(_) => Err(InvalidStateError::NotFinished),
            GroupState::Open(_) => Err(InvalidStateError::NotStarted),
        }
    }
}

impl<T> TaskGroup<T>
where
    T: PartialEq + Debug + Send + 'static,
{
    /// Register a task labelled `task-<index>`; returns its index
    pub fn add<F, E>(&mut self, callable: F, expected: T) -> Result<usize, InvalidStateError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let label = format!("task-{}", self.len());
        self.add_named(&label, callable, expected)
    }

    pub fn add_named<F, E>(
        &mut self,
        label: &str,
        callable: F,
        expected: T,
    ) -> Result<usize, InvalidStateError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let GroupState::Open(tasks) = &mut self.state else {
            return Err(InvalidStateError::AlreadyStarted);
        };

        let index = tasks.len();
        tasks.push(PendingTask {
            label: label.to_string(),
            expected,
            job: Box::new(move || invoke(callable)),
        });

        debug!("Task {label} registered in group {} at index {index}", self.id);
        Ok(index)
    }

    /// Start every registered task and fix the deadline at now + `timeout`.
    ///
    /// Returns without waiting; pair with [`wait`](Self::wait).
    pub fn start(&mut self, timeout: Duration) -> Result<(), InvalidStateError> {
        let tasks = match &mut self.state {
            GroupState::Open(tasks) => std::mem::take(tasks),
            _ => return Err(InvalidStateError::AlreadyStarted),
        };

        info!(
            "Starting task group {} ({}) with {} task(s), timeout {timeout:?}",
            self.name,
            self.id,
            tasks.len()
        );

        let (completion_sender, completion_receiver) = mpsc::channel();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut slots = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            let PendingTask {
                label,
                expected,
                job,
            } = task;

            let sender = completion_sender.clone();
            let group_id = self.id;
            let thread_label = label.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", self.thread_prefix))
                .spawn(move || {
                    let task_started = Instant::now();
                    let invocation = job();
                    let elapsed = task_started.elapsed();

                    let completion = TaskCompletion {
                        index,
                        invocation,
                        elapsed,
                    };
                    if sender.send(completion).is_err() {
                        warn!(
                            "Task {thread_label} in group {group_id} finished after {elapsed:?}, \
                             but the group had already stopped waiting"
                        );
                    }
                });

            let result = match spawned {
                Ok(_) => None,
                Err(e) => {
                    error!("Failed to spawn thread for task {label} in group {}: {e}", self.id);
                    Some(Err(TaskFailure::Spawn(e.to_string())))
                }
            };

            slots.push(TaskSlot {
                label,
                expected,
                result,
                elapsed: None,
            });
        }

        self.state = GroupState::Running(RunningTasks {
            started_at,
            started,
            timeout,
            deadline: started.checked_add(timeout),
            slots,
            completion_receiver,
        });

        Ok(())
    }

    /// Block until every task has reported or the deadline passes.
    ///
    /// Calling this again after the group finished returns the same result.
    pub fn wait(&mut self) -> Result<&TaskGroupResult<T>, InvalidStateError> {
        if matches!(self.state, GroupState::Open(_)) {
            return Err(InvalidStateError::NotStarted);
        }

        if matches!(self.state, GroupState::Running(_)) {
            let state = std::mem::replace(&mut self.state, GroupState::Open(Vec::new()));
            if let GroupState::Running(mut running) = state {
                running.await_completions(self.id);
                let result = running.into_result(self.id);

                info!(
                    "Task group {} ({}) finished in {:?}: overall_success={}",
                    self.name, self.id, result.elapsed, result.overall_success
                );
                self.state = GroupState::Finished(result);
            }
        }

        self.result()
    }

    /// Start all tasks, wait for them, and return the aggregate result
    pub fn run_and_wait(
        &mut self,
        timeout: Duration,
    ) -> Result<&TaskGroupResult<T>, InvalidStateError> {
        self.start(timeout)?;
        self.wait()
    }

    /// Start all tasks, run `action` on the calling thread while they are in
    /// flight, then wait for the group.
    pub fn run_while<R, A>(
        &mut self,
        timeout: Duration,
        action: A,
    ) -> Result<(R, &TaskGroupResult<T>), InvalidStateError>
    where
        A: FnOnce() -> R,
    {
        self.start(timeout)?;
        let value = action();
        let result = self.wait()?;
        Ok((value, result))
    }
}

impl TaskGroup<bool> {
    /// Register a task that is expected to return `true`
    pub fn add_check<F, E>(&mut self, callable: F) -> Result<usize, InvalidStateError>
    where
        F: FnOnce() -> Result<bool, E> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        self.add(callable, true)
    }
}

impl<T> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        if let GroupState::Running(running) = &mut self.state {
            warn!(
                "Task group {} ({}) dropped while running, waiting for its tasks",
                self.name, self.id
            );
            running.await_completions(self.id);
        }
    }
}

impl<T> RunningTasks<T> {
    fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.result.is_none()).count()
    }

    /// Receive completions until all slots are filled or the deadline passes
    fn await_completions(&mut self, group_id: Uuid) {
        let mut remaining = self.pending();

        while remaining > 0 {
            let received = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.completion_receiver.recv_timeout(deadline - now)
                }
                None => self
                    .completion_receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(completion) => {
                    if self.record(completion, group_id) {
                        remaining -= 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(
                        "Completion channel of group {group_id} closed with {remaining} task(s) unreported"
                    );
                    break;
                }
            }
        }

        // Pick up completions that landed right at the deadline
        while remaining > 0 {
            match self.completion_receiver.try_recv() {
                Ok(completion) => {
                    if self.record(completion, group_id) {
                        remaining -= 1;
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn record(&mut self, completion: TaskCompletion<T>, group_id: Uuid) -> bool {
        let TaskCompletion {
            index,
            invocation,
            elapsed,
        } = completion;

        let Some(slot) = self.slots.get_mut(index) else {
            warn!("Received completion for unknown task index {index} in group {group_id}");
            return false;
        };

        if slot.result.is_some() {
            warn!(
                "Duplicate completion for task {} in group {group_id}",
                slot.label
            );
            return false;
        }

        let result = match invocation {
            Invocation::Returned(value) => {
                debug!("Task {} in group {group_id} returned after {elapsed:?}", slot.label);
                Ok(value)
            }
            Invocation::Raised(err) => {
                warn!(
                    "Task {} in group {group_id} failed after {elapsed:?}: {err:#}",
                    slot.label
                );
                Err(TaskFailure::Raised(Arc::new(err)))
            }
            Invocation::Panicked(message) => {
                warn!(
                    "Task {} in group {group_id} panicked after {elapsed:?}: {message}",
                    slot.label
                );
                Err(TaskFailure::Panicked(message))
            }
        };

        slot.result = Some(result);
        slot.elapsed = Some(elapsed);
        true
    }
}

impl<T: PartialEq + Debug> RunningTasks<T> {
    fn into_result(self, group_id: Uuid) -> TaskGroupResult<T> {
        let elapsed = self.started.elapsed();
        let timeout = self.timeout;

        let outcomes: Vec<TaskOutcome<T>> = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let (returned, failure) = match slot.result {
                    Some(Ok(value)) => (Some(value), None),
                    Some(Err(failure)) => (None, Some(failure)),
                    None => {
                        warn!(
                            "Task {} in group {group_id} abandoned after {timeout:?}",
                            slot.label
                        );
                        (None, Some(TaskFailure::Timeout(timeout)))
                    }
                };

                let outcome = TaskOutcome {
                    index,
                    label: slot.label,
                    expected: slot.expected,
                    returned,
                    failure,
                    elapsed: slot.elapsed,
                };

                if outcome.status() == OutcomeStatus::Mismatched {
                    info!(
                        "Task {} in group {group_id} returned {:?}, expected {:?}",
                        outcome.label, outcome.returned, outcome.expected
                    );
                }

                outcome
            })
            .collect();

        let overall_success = outcomes.iter().all(TaskOutcome::matched_expected);

        TaskGroupResult {
            group_id,
            started_at: self.started_at,
            elapsed,
            outcomes,
            overall_success,
        }
    }
}
