//! Shared daemon state.
//!
//! The state is one JSON document map plus the changes and tasks that
//! managers schedule against it. A single lock serializes all access;
//! code runs inside explicit [`StateLock::with`] regions and performs
//! blocking I/O only between regions, so the lock is never held across a
//! suspension point.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

mod runner;
mod task;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use runner::{BoxError, HandlerOutcome, HandlerResult, TaskHandle, TaskRunner};
pub use task::{Change, ChangeStatus, Task, TaskStatus};

/// Errors from state document and task/change accounting operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// No entry stored under the requested key.
    #[error("no state entry for key: {key}")]
    NoState {
        /// The key that was not found.
        key: String,
    },

    /// A stored entry could not be decoded into the requested type.
    #[error("cannot decode state entry {key}: {source}")]
    Decode {
        /// The key whose entry failed to decode.
        key: String,
        /// The underlying decode error.
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("cannot encode state entry {key}: {source}")]
    Encode {
        /// The key whose value failed to encode.
        key: String,
        /// The underlying encode error.
        source: serde_json::Error,
    },

    /// No task with the given id.
    #[error("no task with id {0}")]
    NoTask(TaskId),

    /// No change with the given id.
    #[error("no change with id {0}")]
    NoChange(ChangeId),
}

impl StateError {
    /// Whether this error means "nothing stored yet" rather than a failure.
    #[must_use]
    pub const fn is_no_state(&self) -> bool {
        matches!(self, Self::NoState { .. })
    }
}

/// Identifier of a task in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a change in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeId(u64);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shared state document plus change/task accounting.
#[derive(Debug, Default)]
pub struct State {
    data: BTreeMap<String, serde_json::Value>,
    changes: BTreeMap<ChangeId, Change>,
    tasks: BTreeMap<TaskId, Task>,
    next_id: u64,
    ensure_asap: bool,
}

impl State {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the entry stored under `key`.
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

    /// Store `value` under `key`, replacing any previous entry.
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

    /// Request that the outer ensure loop runs again as soon as possible.
    pub fn request_ensure(&mut self) {
        self.ensure_asap = true;
    }

    /// Consume a pending immediate-ensure request, if any.
    pub fn take_ensure_request(&mut self) -> bool {
        std::mem::take(&mut self.ensure_asap)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Create a new task of `kind` in the `Do` status.
    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let id = TaskId(self.next_id());
        self.tasks.insert(id, Task::new(id, kind, summary));
        id
    }

    /// Look up a task.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Look up a task mutably.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Iterate over all tasks.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Create a new change bundling `tasks`.
    pub fn new_change(&mut self, kind: &str, summary: &str, tasks: &[TaskId]) -> ChangeId {
        let id = ChangeId(self.next_id());
        self.changes.insert(id, Change::new(id, kind, summary, tasks));
        id
    }

    /// Look up a change.
    #[must_use]
    pub fn change(&self, id: ChangeId) -> Option<&Change> {
        self.changes.get(&id)
    }

    /// Iterate over all changes.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    /// Derive the status of a change from its member tasks.
    ///
    /// A change with a failed or held task is `Error` once all members are
    /// terminal; a change whose members are all `Done` is `Done`; anything
    /// else is still in progress.
    #[must_use]
    pub fn change_status(&self, change: &Change) -> ChangeStatus {
        let mut all_terminal = true;
        let mut any_failed = false;
        for id in change.task_ids() {
            match self.tasks.get(id).map(Task::status) {
                Some(TaskStatus::Done) => {},
                Some(TaskStatus::Error | TaskStatus::Hold) => any_failed = true,
                _ => all_terminal = false,
            }
        }
        if !all_terminal {
            ChangeStatus::Doing
        } else if any_failed {
            ChangeStatus::Error
        } else {
            ChangeStatus::Done
        }
    }

    /// Whether a change has reached a terminal status.
    #[must_use]
    pub fn change_is_ready(&self, change: &Change) -> bool {
        self.change_status(change).is_ready()
    }

    /// Put every task transitively waiting on `failed` on `Hold`.
    pub(crate) fn hold_dependents(&mut self, failed: TaskId) {
        let mut blocked = vec![failed];
        while let Some(cause) = blocked.pop() {
            let dependents: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| {
                    t.waits_on(cause) && !matches!(t.status(), TaskStatus::Error | TaskStatus::Hold)
                })
                .map(Task::id)
                .collect();
            for id in dependents {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.set_status(TaskStatus::Hold);
                }
                blocked.push(id);
            }
        }
    }
}

/// The single lock serializing all state access.
///
/// All reads and writes happen inside [`with`](Self::with) regions. The
/// closure signature keeps the lock scoped: blocking work (network calls,
/// key generation) happens between regions, never inside one.
#[derive(Debug)]
pub struct StateLock {
    inner: Mutex<State>,
}

impl StateLock {
    /// Wrap a state in its lock.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Run `f` with exclusive access to the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard)
    }
}

/// Read-only view of per-snap configuration stored in the state.
///
/// Configuration lives under the `config` entry as a map of snap name to
/// a flat map of dotted option keys.
pub struct ConfigTransaction<'a> {
    config: Option<serde_json::Value>,
    _state: &'a State,
}

impl<'a> ConfigTransaction<'a> {
    /// Open a transaction over the current configuration.
    #[must_use]
    pub fn new(state: &'a State) -> Self {
        Self {
            config: state.data.get("config").cloned(),
            _state: state,
        }
    }

    /// Read the option `key` of `snap`, or `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Decode`] when the stored option does not
    /// decode into `T`.
    pub fn get_maybe<T: DeserializeOwned>(
        &self,
        snap: &str,
        key: &str,
    ) -> Result<Option<T>, StateError> {
        let Some(value) = self
            .config
            .as_ref()
            .and_then(|c| c.get(snap))
            .and_then(|s| s.get(key))
        else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| StateError::Decode {
                key: format!("config.{snap}.{key}"),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_is_no_state() {
        let st = State::new();
        let err = st.get::<bool>("seeded").unwrap_err();
        assert!(err.is_no_state());
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut st = State::new();
        st.set("seeded", &true).unwrap();
        assert!(st.get::<bool>("seeded").unwrap());
    }

    #[test]
    fn get_wrong_type_is_decode_error() {
        let mut st = State::new();
        st.set("seeded", &true).unwrap();
        let err = st.get::<String>("seeded").unwrap_err();
        assert!(matches!(err, StateError::Decode { .. }));
        assert!(!err.is_no_state());
    }

    #[test]
    fn ensure_request_is_consumed_once() {
        let mut st = State::new();
        assert!(!st.take_ensure_request());
        st.request_ensure();
        assert!(st.take_ensure_request());
        assert!(!st.take_ensure_request());
    }

    #[test]
    fn change_status_derivation() {
        let mut st = State::new();
        let t1 = st.new_task("a", "task a");
        let t2 = st.new_task("b", "task b");
        let chg = st.new_change("demo", "demo change", &[t1, t2]);

        let change = st.change(chg).unwrap().clone();
        assert_eq!(st.change_status(&change), ChangeStatus::Doing);
        assert!(!st.change_is_ready(&change));

        st.task_mut(t1).unwrap().set_status(TaskStatus::Done);
        st.task_mut(t2).unwrap().set_status(TaskStatus::Done);
        assert_eq!(st.change_status(&change), ChangeStatus::Done);
        assert!(st.change_is_ready(&change));

        st.task_mut(t2).unwrap().set_status(TaskStatus::Error);
        assert_eq!(st.change_status(&change), ChangeStatus::Error);
        assert!(st.change_is_ready(&change));
    }

    #[test]
    fn hold_dependents_is_transitive() {
        let mut st = State::new();
        let t1 = st.new_task("a", "task a");
        let t2 = st.new_task("b", "task b");
        let t3 = st.new_task("c", "task c");
        st.task_mut(t2).unwrap().wait_for(t1);
        st.task_mut(t3).unwrap().wait_for(t2);

        st.task_mut(t1).unwrap().set_status(TaskStatus::Error);
        st.hold_dependents(t1);

        assert_eq!(st.task(t2).unwrap().status(), TaskStatus::Hold);
        assert_eq!(st.task(t3).unwrap().status(), TaskStatus::Hold);
    }

    #[test]
    fn config_transaction_reads_options() {
        let mut st = State::new();
        st.set(
            "config",
            &serde_json::json!({
                "pc": { "device-service.url": "https://svc.example/api/" }
            }),
        )
        .unwrap();

        let tr = ConfigTransaction::new(&st);
        let url: Option<String> = tr.get_maybe("pc", "device-service.url").unwrap();
        assert_eq!(url.as_deref(), Some("https://svc.example/api/"));
        let missing: Option<String> = tr.get_maybe("pc", "registration.body").unwrap();
        assert!(missing.is_none());
    }
}
