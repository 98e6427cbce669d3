//! Task dispatch.
//!
//! The runner owns the handler registry and the worker threads executing
//! tasks. Handlers are idempotent: a task may be re-dispatched after a
//! retry or a daemon restart with partial prior effects visible in its
//! scratch data.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{StateLock, TaskId, TaskStatus};

/// Boxed error type returned by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a handler asks the runner to do with its task.
///
/// Rescheduling is an outcome, not an error: the type distinguishes
/// "dispatch me again" from "fail me".
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The task completed; mark it `Done`.
    Done,
    /// Re-dispatch the task, after the given holdoff when set.
    ///
    /// The task keeps its scratch data, so the next incarnation resumes
    /// from whatever was persisted before returning.
    Retry {
        /// Minimum delay before the next dispatch; `None` means as soon
        /// as the next ensure cycle runs.
        after: Option<Duration>,
    },
}

/// Result type returned by task handlers.
pub type HandlerResult = Result<HandlerOutcome, BoxError>;

type Handler = Arc<dyn Fn(&TaskHandle) -> HandlerResult + Send + Sync>;

/// Handle passed to a running task handler.
///
/// The handle does not hold the state lock; handlers open their own
/// scoped regions via [`with_state`](Self::with_state) and run blocking
/// work between them. Log helpers reacquire the lock briefly.
pub struct TaskHandle {
    id: TaskId,
    state: Arc<StateLock>,
    aborted: Arc<AtomicBool>,
}

impl TaskHandle {
    /// The id of the task being run.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Run `f` with exclusive access to the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut super::State) -> R) -> R {
        self.state.with(f)
    }

    /// Read this task's scratch data stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`super::StateError::NoState`] when nothing is stored under
    /// `key`, or a decode error when the entry does not match `T`.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, super::StateError> {
        self.with_state(|st| {
            st.task(self.id)
                .ok_or(super::StateError::NoTask(self.id))?
                .get(key)
        })
    }

    /// Persist scratch data for this task under `key`.
    ///
    /// # Errors
    ///
    /// Returns an encode error when the value cannot be serialized.
    pub fn set<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), super::StateError> {
        self.with_state(|st| {
            st.task_mut(self.id)
                .ok_or(super::StateError::NoTask(self.id))?
                .set(key, value)
        })
    }

    /// Append an informational line to the task log.
    pub fn log_info(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(task = %self.id, "{message}");
        self.with_state(|st| {
            if let Some(task) = st.task_mut(self.id) {
                task.add_log(format!("INFO: {message}"));
            }
        });
    }

    /// Append an error line to the task log.
    pub fn log_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(task = %self.id, "{message}");
        self.with_state(|st| {
            if let Some(task) = st.task_mut(self.id) {
                task.add_log(format!("ERROR: {message}"));
            }
        });
    }

    /// Whether the runner was asked to stop; handlers abort cooperatively
    /// before their next blocking step.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Dispatches runnable tasks to their registered handlers.
pub struct TaskRunner {
    state: Arc<StateLock>,
    handlers: HashMap<String, Handler>,
    running: Arc<Mutex<HashSet<TaskId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    aborted: Arc<AtomicBool>,
}

impl TaskRunner {
    /// Create a runner over the given state.
    #[must_use]
    pub fn new(state: Arc<StateLock>) -> Self {
        Self {
            state,
            handlers: HashMap::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            workers: Mutex::new(Vec::new()),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the handler for tasks of `kind`.
    pub fn add_handler(
        &mut self,
        kind: &str,
        handler: impl Fn(&TaskHandle) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.handlers.insert(kind.to_string(), Arc::new(handler));
    }

    /// Dispatch every runnable task on a worker thread.
    ///
    /// A task is runnable when a handler is registered for its kind, its
    /// status is `Do` (or `Doing` from an interrupted run), its holdoff
    /// has expired, all of its predecessors are `Done` and it is not
    /// already running. A task whose predecessor failed is put on `Hold`.
    pub fn ensure(&self) {
        if self.aborted.load(Ordering::SeqCst) {
            return;
        }
        let now = Utc::now();

        let dispatch: Vec<(TaskId, Handler)> = self.state.with(|st| {
            let mut running = self.running.lock().unwrap();
            let mut ready = Vec::new();
            let mut held = Vec::new();

            for task in st.tasks() {
                if !matches!(task.status(), TaskStatus::Do | TaskStatus::Doing)
                    || running.contains(&task.id())
                {
                    continue;
                }
                let Some(handler) = self.handlers.get(task.kind()) else {
                    continue;
                };
                if task.not_before().is_some_and(|at| at > now) {
                    continue;
                }
                let mut blocked = false;
                let mut failed_predecessor = false;
                for pred in task.predecessors() {
                    match st.task(*pred).map(super::Task::status) {
                        Some(TaskStatus::Done) => {},
                        Some(TaskStatus::Error | TaskStatus::Hold) => failed_predecessor = true,
                        _ => blocked = true,
                    }
                }
                if failed_predecessor {
                    held.push(task.id());
                    continue;
                }
                if blocked {
                    continue;
                }
                ready.push((task.id(), Arc::clone(handler)));
            }

            for id in held {
                if let Some(task) = st.task_mut(id) {
                    task.set_status(TaskStatus::Hold);
                }
            }
            for (id, _) in &ready {
                if let Some(task) = st.task_mut(*id) {
                    task.set_status(TaskStatus::Doing);
                }
                running.insert(*id);
            }
            ready
        });

        for (id, handler) in dispatch {
            let handle = TaskHandle {
                id,
                state: Arc::clone(&self.state),
                aborted: Arc::clone(&self.aborted),
            };
            let state = Arc::clone(&self.state);
            let running = Arc::clone(&self.running);
            let worker = std::thread::spawn(move || {
                let result = handler(&handle);
                state.with(|st| {
                    match result {
                        Ok(HandlerOutcome::Done) => {
                            if let Some(task) = st.task_mut(id) {
                                task.set_status(TaskStatus::Done);
                            }
                        },
                        Ok(HandlerOutcome::Retry { after }) => {
                            if let Some(task) = st.task_mut(id) {
                                task.set_status(TaskStatus::Do);
                                task.set_not_before(
                                    after.and_then(|d| {
                                        chrono::Duration::from_std(d).ok().map(|d| Utc::now() + d)
                                    }),
                                );
                            }
                        },
                        Err(err) => {
                            warn!(task = %id, "task failed: {err}");
                            if let Some(task) = st.task_mut(id) {
                                task.set_status(TaskStatus::Error);
                                task.add_log(format!("ERROR: {err}"));
                            }
                            st.hold_dependents(id);
                        },
                    }
                    st.request_ensure();
                    running.lock().unwrap().remove(&id);
                });
            });
            self.workers.lock().unwrap().push(worker);
        }
    }

    /// Wait for all outstanding workers to finish.
    pub fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Ask handlers to abort and wait for them.
    pub fn stop(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.wait();
    }
}
