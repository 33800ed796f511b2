//! Remote task polling.
//!
//! Volume and VM commands on the management plane are asynchronous: the call
//! returns a task id and the work completes later. [`TaskPoller`] turns that
//! into a synchronous completion signal by polling the task with exponential
//! backoff until it reaches a terminal state or the wait ceiling elapses.
//!
//! A timeout is **not** an error. The last observed non-terminal state is
//! returned and callers must inspect it (see [`TaskState::is_terminal`]).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::IcsError;
use crate::rest::ManagementApi;

/// Delay before the first poll.
pub const INITIAL_POLL_DELAY: Duration = Duration::from_millis(100);
/// First backoff interval between successive polls; doubles every round.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Maximum total time spent waiting for a task.
pub const MAX_TASK_WAIT: Duration = Duration::from_secs(60);

/// Handle to a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
}

impl Task {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task_id)
    }
}

/// State of a remote task as reported by the management plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// `FINISHED`: the task completed successfully.
    Finished,
    /// `ERROR`: the task failed.
    Error,
    /// Any other state string (`RUNNING`, `PENDING`, ...).
    Pending(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Pending(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl From<&str> for TaskState {
    fn from(s: &str) -> Self {
        match s {
            "FINISHED" => Self::Finished,
            "ERROR" => Self::Error,
            other => Self::Pending(other.to_owned()),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of polling a task: the state plus whatever detail the server
/// attached to it (error message for `ERROR`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task: Task,
    pub state: TaskState,
    pub detail: String,
    /// Number of status requests issued.
    pub polls: u32,
}

impl TaskOutcome {
    /// Map the outcome to the driver's error taxonomy: `FINISHED` is success,
    /// `ERROR` is [`IcsError::TaskFailed`] and a still-running task is
    /// [`IcsError::TaskIncomplete`].
    pub fn into_result(self) -> Result<(), IcsError> {
        match self.state {
            TaskState::Finished => Ok(()),
            TaskState::Error => Err(IcsError::TaskFailed {
                task_id: self.task.task_id,
                detail: self.detail,
            }),
            TaskState::Pending(state) => Err(IcsError::TaskIncomplete {
                task_id: self.task.task_id,
                state,
            }),
        }
    }
}

/// Polls remote tasks until they settle.
#[derive(Debug, Clone, Copy)]
pub struct TaskPoller {
    initial_delay: Duration,
    initial_backoff: Duration,
    max_wait: Duration,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_POLL_DELAY,
            initial_backoff: INITIAL_BACKOFF,
            max_wait: MAX_TASK_WAIT,
        }
    }
}

impl TaskPoller {
    pub fn new(initial_delay: Duration, initial_backoff: Duration, max_wait: Duration) -> Self {
        Self {
            initial_delay,
            initial_backoff,
            max_wait,
        }
    }

    /// Poll `task` until it is `FINISHED` or `ERROR`, or until the wait
    /// ceiling elapses, in which case the last observed state is returned.
    ///
    /// A failed status request is returned immediately; only the gap between
    /// successive polls is retried with backoff.
    #[instrument(skip(self, api), fields(task_id = %task))]
    pub async fn poll(&self, api: &dyn ManagementApi, task: &Task) -> Result<TaskOutcome, IcsError> {
        if task.task_id.is_empty() {
            return Err(IcsError::InvalidArgument("task id is empty".into()));
        }

        let deadline = Instant::now() + self.max_wait;
        let mut backoff = self.initial_backoff;
        let mut polls = 0u32;

        tokio::time::sleep(self.initial_delay).await;
        loop {
            let info = api.get_task_info(&task.task_id).await?;
            polls += 1;
            let state = TaskState::from(info.state.as_str());
            debug!(%state, polls, "polled task");

            if state.is_terminal() {
                info!(%state, polls, "task reached terminal state");
                return Ok(TaskOutcome {
                    task: task.clone(),
                    state,
                    detail: info.detail,
                    polls,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%state, polls, wait = ?self.max_wait, "gave up waiting for task");
                return Ok(TaskOutcome {
                    task: task.clone(),
                    state,
                    detail: info.detail,
                    polls,
                });
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    /// Poll `task` and map the outcome through [`TaskOutcome::into_result`].
    pub async fn wait(&self, api: &dyn ManagementApi, task: &Task) -> Result<(), IcsError> {
        self.poll(api, task).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimManagementPlane;

    #[tokio::test(start_paused = true)]
    async fn returns_finished_after_scripted_polls() {
        let sim = SimManagementPlane::new("vc-1");
        sim.script_task("t-1", &["PENDING", "PENDING", "FINISHED"]);

        let outcome = TaskPoller::default()
            .poll(&sim, &Task::new("t-1"))
            .await
            .unwrap();

        assert_eq!(outcome.state, TaskState::Finished);
        assert_eq!(outcome.polls, 3);
        assert_eq!(sim.calls().task_polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_last_state_not_error() {
        let sim = SimManagementPlane::new("vc-1");
        sim.script_task("t-2", &["RUNNING"]);

        let started = Instant::now();
        let outcome = TaskPoller::default()
            .poll(&sim, &Task::new("t-2"))
            .await
            .unwrap();

        assert_eq!(outcome.state, TaskState::Pending("RUNNING".into()));
        assert!(started.elapsed() >= MAX_TASK_WAIT);
        // 100ms, 200ms, ... doubling: only a handful of polls fit in a minute.
        assert!(outcome.polls < 16, "polled {} times", outcome.polls);
        assert!(matches!(
            outcome.into_result(),
            Err(IcsError::TaskIncomplete { state, .. }) if state == "RUNNING"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_is_terminal() {
        let sim = SimManagementPlane::new("vc-1");
        sim.script_task("t-3", &["RUNNING", "ERROR"]);

        let err = TaskPoller::default()
            .wait(&sim, &Task::new("t-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, IcsError::TaskFailed { task_id, .. } if task_id == "t-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_not_retried() {
        let sim = SimManagementPlane::new("vc-1");
        // No script registered for this id: the simulator answers 404.
        let err = TaskPoller::default()
            .poll(&sim, &Task::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, IcsError::Rest { status: 404, .. }));
        assert_eq!(sim.calls().task_polls, 1);
    }

    #[tokio::test]
    async fn empty_task_id_is_rejected() {
        let sim = SimManagementPlane::new("vc-1");
        let err = TaskPoller::default()
            .poll(&sim, &Task::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, IcsError::InvalidArgument(_)));
    }

    #[test]
    fn state_parsing() {
        assert_eq!(TaskState::from("FINISHED"), TaskState::Finished);
        assert_eq!(TaskState::from("ERROR"), TaskState::Error);
        assert!(!TaskState::from("RUNNING").is_terminal());
        assert_eq!(TaskState::from("PENDING").to_string(), "PENDING");
    }
}
