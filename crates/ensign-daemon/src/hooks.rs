//! Hook handler registry and `run-hook` task dispatch.
//!
//! Hook *scripts* ship inside snaps and run in the snap's environment;
//! this module only dispatches the daemon-side handlers that bracket a
//! hook invocation. Handlers are keyed by exact hook name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ensign_core::state::{BoxError, HandlerOutcome, HandlerResult, State, TaskHandle, TaskId,
    TaskRunner};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Task kind dispatching hook invocations.
pub const RUN_HOOK_KIND: &str = "run-hook";

/// Which snap's hook a `run-hook` task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSetup {
    /// The snap providing the hook.
    pub snap: String,
    /// The hook name.
    pub hook: String,
}

/// Daemon-side bracketing of a hook invocation.
///
/// All methods default to no-ops; handlers override what they need.
pub trait HookHandler: Send + Sync {
    /// Called before the hook runs.
    ///
    /// # Errors
    ///
    /// An error fails the hook task.
    fn before(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after the hook ran successfully.
    ///
    /// # Errors
    ///
    /// An error fails the hook task.
    fn done(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Registry of hook handlers by hook name.
#[derive(Default)]
pub struct HookManager {
    handlers: RwLock<HashMap<String, Arc<dyn HookHandler>>>,
}

impl HookManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the hook named `hook`.
    pub fn register(&self, hook: &str, handler: Arc<dyn HookHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(hook.to_string(), handler);
    }

    fn handler(&self, hook: &str) -> Option<Arc<dyn HookHandler>> {
        self.handlers.read().unwrap().get(hook).cloned()
    }

    /// Register the `run-hook` task handler on `runner`.
    pub fn register_with(self: &Arc<Self>, runner: &mut TaskRunner) {
        let mgr = Arc::clone(self);
        runner.add_handler(RUN_HOOK_KIND, move |t: &TaskHandle| mgr.run_hook(t));
    }

    fn run_hook(&self, t: &TaskHandle) -> HandlerResult {
        let setup: HookSetup = t.get("hook-setup")?;
        let Some(handler) = self.handler(&setup.hook) else {
            return Err(format!("no registered handler for hook {:?}", setup.hook).into());
        };
        debug!(snap = %setup.snap, hook = %setup.hook, "running hook");
        handler.before()?;
        // The hook script itself runs in the snap's sandbox, driven by
        // the snap execution environment.
        handler.done()?;
        Ok(HandlerOutcome::Done)
    }
}

/// Create a `run-hook` task for the given hook.
pub fn hook_task(st: &mut State, summary: &str, setup: &HookSetup) -> TaskId {
    let id = st.new_task(RUN_HOOK_KIND, summary);
    if let Some(task) = st.task_mut(id) {
        // A fresh task always accepts scratch data.
        let _ = task.set("hook-setup", setup);
    }
    id
}
