//! Tasks and changes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ChangeId, StateError, TaskId};

/// The lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Queued, not yet dispatched (or re-queued for a retry).
    Do,
    /// Currently running on a worker.
    Doing,
    /// Completed successfully.
    Done,
    /// Failed terminally.
    Error,
    /// Abandoned because a predecessor failed.
    Hold,
}

impl TaskStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Hold)
    }

    /// The status name as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Do => "Do",
            Self::Doing => "Doing",
            Self::Done => "Done",
            Self::Error => "Error",
            Self::Hold => "Hold",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The derived status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeStatus {
    /// At least one member task is not terminal yet.
    Doing,
    /// All member tasks completed successfully.
    Done,
    /// All member tasks are terminal and at least one failed.
    Error,
}

impl ChangeStatus {
    /// Whether the change has reached a terminal status.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// The status name as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Doing => "Doing",
            Self::Done => "Done",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work scheduled in the state.
///
/// Tasks carry their own scratch data so a handler interrupted mid-way
/// resumes from what it already persisted rather than repeating work.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    status: TaskStatus,
    wait_for: Vec<TaskId>,
    data: BTreeMap<String, serde_json::Value>,
    log: Vec<String>,
    not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: TaskStatus::Do,
            wait_for: Vec::new(),
            data: BTreeMap::new(),
            log: Vec::new(),
            not_before: None,
        }
    }

    /// The task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// The task kind, which selects its handler.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The human-readable summary.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// The current status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Set the status.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// Make this task wait for `predecessor` to complete.
    pub fn wait_for(&mut self, predecessor: TaskId) {
        self.wait_for.push(predecessor);
    }

    /// The predecessors this task waits for.
    #[must_use]
    pub fn predecessors(&self) -> &[TaskId] {
        &self.wait_for
    }

    pub(crate) fn waits_on(&self, id: TaskId) -> bool {
        self.wait_for.contains(&id)
    }

    /// Read scratch data stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NoState`] when nothing is stored under `key`
    /// and [`StateError::Decode`] when the entry does not decode into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let value = self.data.get(key).ok_or_else(|| StateError::NoState {
            key: key.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|source| StateError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Store scratch data under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Encode`] when the value cannot be serialized.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Append a line to the task log.
    pub fn add_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    /// The accumulated log lines.
    #[must_use]
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// The earliest time this task may be dispatched again, if any.
    #[must_use]
    pub const fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// Set or clear the dispatch holdoff.
    pub fn set_not_before(&mut self, at: Option<DateTime<Utc>>) {
        self.not_before = at;
    }
}

/// A group of tasks driven to completion together.
#[derive(Debug, Clone)]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    task_ids: Vec<TaskId>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str, tasks: &[TaskId]) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            task_ids: tasks.to_vec(),
        }
    }

    /// The change id.
    #[must_use]
    pub const fn id(&self) -> ChangeId {
        self.id
    }

    /// The change kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The human-readable summary.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// The member tasks.
    #[must_use]
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }
}
