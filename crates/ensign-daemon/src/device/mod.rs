//! The device manager.
//!
//! Owns the device identity lifecycle: seeding the initial system state,
//! becoming operational (device key generation and serial registration)
//! and recording a successful boot. The manager's [`ensure`] cycle is
//! invoked periodically by the daemon; each invocation proposes at most
//! one change per goal and then drives the task runner one step.
//!
//! [`ensure`]: DeviceManager::ensure

mod config;
mod error;
mod handlers;
mod install;
mod protocol;
mod view;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ensign_core::asserts::{self, Assertion, AssertionType, Database, DeviceKey, FsKeypairManager};
use ensign_core::state::{BoxError, State, StateLock, TaskId, TaskRunner};
use tracing::{debug, info};

pub use config::{DEFAULT_KEY_LENGTH, ManagerConfig, RepeatRequestSerial, STAGING_ENV};
pub use error::{DeviceError, EnsureError};
pub use install::check_gadget_or_kernel;
pub use view::{DeviceIdentity, device, model, serial, set_device};

use crate::hooks::{HookHandler, HookManager, HookSetup, hook_task};
use crate::snaps;

/// Change kind bundling the seed task sets.
pub const SEED_CHANGE_KIND: &str = "seed";

/// Change kind bundling the become-operational tasks.
pub const BECOME_OPERATIONAL_CHANGE_KIND: &str = "become-operational";

const BACKOFF_INITIAL: Duration = Duration::from_secs(5 * 60);
const BACKOFF_SOFT_CAP: Duration = Duration::from_secs(12 * 60 * 60);
const BACKOFF_FINAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Loads the seed: the initial set of snaps and assertions to install.
pub trait SeedLoader: Send + Sync {
    /// Create the tasks installing the seed, returning one task set per
    /// lane. An empty result means there is nothing to seed yet.
    ///
    /// # Errors
    ///
    /// An error aborts this ensure cycle's seeding goal; it is retried
    /// on the next cycle.
    fn load(&self, st: &mut State) -> Result<Vec<Vec<TaskId>>, BoxError>;
}

/// Boot status integration with the bootloader and snap revisions.
pub trait BootSupport: Send + Sync {
    /// Mark the current boot as successful in the bootloader.
    ///
    /// # Errors
    ///
    /// An error is reported from the ensure cycle and retried on the
    /// next one.
    fn mark_boot_successful(&self) -> Result<(), BoxError>;

    /// Update the recorded boot revisions of the kernel and OS snaps.
    ///
    /// # Errors
    ///
    /// An error is reported from the ensure cycle and retried on the
    /// next one.
    fn update_boot_revisions(&self, st: &mut State) -> Result<(), BoxError>;
}

/// Fetches assertions from the snap store.
pub trait StoreClient: Send + Sync {
    /// Fetch the assertion of `typ` with the given primary key.
    ///
    /// # Errors
    ///
    /// An error means the assertion could not be retrieved; callers
    /// decide whether that is fatal.
    fn assertion(&self, typ: AssertionType, primary_key: &[&str]) -> Result<Assertion, BoxError>;
}

struct PrepareDeviceHandler;

impl HookHandler for PrepareDeviceHandler {}

/// Manages the device identity and device policies.
pub struct DeviceManager {
    state: Arc<StateLock>,
    db: Arc<Mutex<Database>>,
    keypair_mgr: Arc<FsKeypairManager>,
    runner: TaskRunner,
    config: Arc<ManagerConfig>,
    seed_loader: Arc<dyn SeedLoader>,
    boot: Arc<dyn BootSupport>,

    boot_ok_ran: bool,
    boot_revisions_updated: bool,

    last_become_operational_attempt: Option<DateTime<Utc>>,
    become_operational_backoff: Duration,
}

impl DeviceManager {
    /// Create a device manager, registering its task handlers and the
    /// `prepare-device` hook handler.
    ///
    /// # Errors
    ///
    /// Returns an error when the device key directory cannot be opened.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        state: Arc<StateLock>,
        db: Arc<Mutex<Database>>,
        hook_mgr: &Arc<HookManager>,
        config: Arc<ManagerConfig>,
        seed_loader: Arc<dyn SeedLoader>,
        boot: Arc<dyn BootSupport>,
        store: Arc<dyn StoreClient>,
    ) -> Result<Self, DeviceError> {
        let keypair_mgr = Arc::new(FsKeypairManager::new(&config.device_key_dir)?);
        let mut runner = TaskRunner::new(Arc::clone(&state));

        hook_mgr.register("prepare-device", Arc::new(PrepareDeviceHandler));
        hook_mgr.register_with(&mut runner);

        {
            let keypair_mgr = Arc::clone(&keypair_mgr);
            let config = Arc::clone(&config);
            runner.add_handler("generate-device-key", move |t| {
                handlers::do_generate_device_key(t, &keypair_mgr, &config)
            });
        }
        {
            let keypair_mgr = Arc::clone(&keypair_mgr);
            let db = Arc::clone(&db);
            let config = Arc::clone(&config);
            let store = Arc::clone(&store);
            runner.add_handler("request-serial", move |t| {
                handlers::do_request_serial(t, &keypair_mgr, &db, &store, &config)
            });
        }
        runner.add_handler("mark-seeded", handlers::do_mark_seeded);

        Ok(Self {
            state,
            db,
            keypair_mgr,
            runner,
            config,
            seed_loader,
            boot,
            boot_ok_ran: false,
            boot_revisions_updated: false,
            last_become_operational_attempt: None,
            become_operational_backoff: Duration::ZERO,
        })
    }

    /// The manager's configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<ManagerConfig> {
        &self.config
    }

    /// Run one ensure cycle: propose pending changes for the seeding,
    /// become-operational and boot-ok goals, then drive the task runner.
    ///
    /// # Errors
    ///
    /// Returns the accumulated errors of the individual goals; every goal
    /// runs regardless of earlier failures.
    pub fn ensure(&mut self) -> Result<(), EnsureError> {
        let mut errors = Vec::new();

        if let Err(err) = self.ensure_seed_yaml() {
            errors.push(err);
        }
        if let Err(err) = self.ensure_operational() {
            errors.push(err);
        }
        if let Err(err) = self.ensure_boot_ok() {
            errors.push(err);
        }

        self.runner.ensure();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EnsureError { errors })
        }
    }

    /// Wait for running tasks to finish.
    pub fn wait(&self) {
        self.runner.wait();
    }

    /// Ask running tasks to abort and wait for them.
    pub fn stop(&self) {
        self.runner.stop();
    }

    fn ensure_seed_yaml(&mut self) -> Result<(), DeviceError> {
        let state = Arc::clone(&self.state);
        state.with(|st| {
            let seeded = match st.get::<bool>("seeded") {
                Ok(seeded) => seeded,
                Err(err) if err.is_no_state() => false,
                Err(err) => return Err(err.into()),
            };
            if seeded {
                return Ok(());
            }

            if change_in_flight(st, SEED_CHANGE_KIND) {
                return Ok(());
            }

            let task_sets = self
                .seed_loader
                .load(st)
                .map_err(|err| DeviceError::Seed(err.to_string()))?;
            if task_sets.is_empty() {
                return Ok(());
            }

            let all: Vec<TaskId> = task_sets.into_iter().flatten().collect();
            st.new_change(SEED_CHANGE_KIND, "Initialize system state", &all);
            st.request_ensure();
            info!("created seed change");
            Ok(())
        })
    }

    /// Whether to abstain from another become-operational attempt while
    /// the backoff interval has not expired. When the attempt proceeds,
    /// the next backoff doubles, up to a soft cap of twelve hours after
    /// which it jumps to a day.
    fn ensure_operational_should_backoff(&mut self, now: DateTime<Utc>) -> bool {
        if let (Some(last), Ok(backoff)) = (
            self.last_become_operational_attempt,
            chrono::Duration::from_std(self.become_operational_backoff),
        ) {
            if last + backoff > now {
                return true;
            }
        }
        if self.become_operational_backoff.is_zero() {
            self.become_operational_backoff = BACKOFF_INITIAL;
        } else {
            let doubled = self.become_operational_backoff * 2;
            self.become_operational_backoff = if doubled > BACKOFF_SOFT_CAP {
                BACKOFF_FINAL
            } else {
                doubled
            };
        }
        self.last_become_operational_attempt = Some(now);
        false
    }

    fn ensure_operational(&mut self) -> Result<(), DeviceError> {
        let now = Utc::now();
        let state = Arc::clone(&self.state);
        state.with(|st| {
            let identity = view::device(st)?;

            if !identity.serial.is_empty() {
                // Serial is set, we are all set.
                return Ok(());
            }

            if identity.brand.is_empty() || identity.model.is_empty() {
                // Cannot proceed until seeding has loaded the model
                // assertion and set the brand and model; that is
                // optional on classic.
                return Ok(());
            }

            if change_in_flight(st, BECOME_OPERATIONAL_CHANGE_KIND) {
                return Ok(());
            }

            let gadget = match snaps::gadget_info(st) {
                Ok(gadget) => gadget,
                Err(err) if err.is_no_state() => {
                    // No gadget installed yet, cannot proceed.
                    return Ok(());
                },
                Err(err) => return Err(err.into()),
            };

            // Keep some backoff between full retries.
            if self.ensure_operational_should_backoff(now) {
                return Ok(());
            }
            self.config.inc_operational_attempts();

            let mut tasks = Vec::new();
            let mut prepare_device = None;
            if gadget.hooks.contains("prepare-device") {
                let id = hook_task(
                    st,
                    "Run prepare-device hook",
                    &HookSetup {
                        snap: gadget.name.clone(),
                        hook: "prepare-device".to_string(),
                    },
                );
                prepare_device = Some(id);
                tasks.push(id);
            }

            let gen_key = st.new_task("generate-device-key", "Generate device key");
            if let Some(prepare_device) = prepare_device {
                if let Some(task) = st.task_mut(gen_key) {
                    task.wait_for(prepare_device);
                }
            }
            tasks.push(gen_key);

            let request_serial = st.new_task("request-serial", "Request device serial");
            if let Some(task) = st.task_mut(request_serial) {
                task.wait_for(gen_key);
            }
            tasks.push(request_serial);

            st.new_change(BECOME_OPERATIONAL_CHANGE_KIND, "Initialize device", &tasks);
            info!(brand = %identity.brand, model = %identity.model,
                attempt = self.config.operational_attempts(), "created become-operational change");
            Ok(())
        })
    }

    fn ensure_boot_ok(&mut self) -> Result<(), DeviceError> {
        if self.config.on_classic {
            return Ok(());
        }

        if !self.boot_ok_ran {
            self.boot
                .mark_boot_successful()
                .map_err(|err| DeviceError::Boot(format!("cannot mark boot successful: {err}")))?;
            self.boot_ok_ran = true;
            debug!("marked boot successful");
        }

        if !self.boot_revisions_updated {
            let state = Arc::clone(&self.state);
            state.with(|st| {
                self.boot
                    .update_boot_revisions(st)
                    .map_err(|err| DeviceError::Boot(err.to_string()))
            })?;
            self.boot_revisions_updated = true;
        }

        Ok(())
    }

    /// The device model assertion.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] while the identity or the
    /// assertion is not established.
    pub fn model(&self) -> Result<asserts::Model, DeviceError> {
        self.state.with(|st| {
            let db = self.db.lock().unwrap();
            view::model(st, &db, &self.config.series)
        })
    }

    /// The device serial assertion.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] while the device has no serial.
    pub fn serial(&self) -> Result<asserts::Serial, DeviceError> {
        self.state.with(|st| {
            let db = self.db.lock().unwrap();
            view::serial(st, &db)
        })
    }

    /// Produce a signed device-session-request with the given nonce,
    /// also returning the device serial assertion.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] while the device has no serial
    /// and key errors when the device key cannot be loaded.
    pub fn device_session_request(
        &self,
        nonce: &str,
    ) -> Result<(asserts::DeviceSessionRequest, asserts::Serial), DeviceError> {
        let (serial, key) = self.state.with(|st| -> Result<_, DeviceError> {
            let serial = {
                let db = self.db.lock().unwrap();
                view::serial(st, &db)?
            };
            let identity = view::device(st)?;
            let key = handlers::device_key(&self.keypair_mgr, &identity)?;
            Ok((serial, key))
        })?;
        let session = view::device_session_request(&serial, &key, nonce)?;
        Ok((session, serial))
    }

    /// Whether the device may auto-refresh its snaps.
    ///
    /// Auto-refresh waits for seeding and registration, but gives up
    /// waiting for a serial after three full attempts so at least the
    /// core snap can upgrade when registration keeps failing.
    ///
    /// # Errors
    ///
    /// Returns state or database errors; an unset identity is not an
    /// error.
    pub fn can_auto_refresh(&self) -> Result<bool, DeviceError> {
        self.state.with(|st| {
            let seeded = match st.get::<bool>("seeded") {
                Ok(seeded) => seeded,
                Err(err) if err.is_no_state() => false,
                Err(err) => return Err(err.into()),
            };
            if !seeded {
                return Ok(false);
            }

            let db = self.db.lock().unwrap();

            match view::model(st, &db, &self.config.series) {
                // No model, no need to wait for a serial; can happen
                // only on classic.
                Err(err) if err.is_not_ready() => return Ok(true),
                Err(err) => return Err(err),
                Ok(_) => {},
            }

            if self.config.operational_attempts() >= 3 {
                return Ok(true);
            }

            match view::serial(st, &db) {
                Ok(_) => Ok(true),
                Err(err) if err.is_not_ready() => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    /// Refuse gadget or kernel installs that contradict the model.
    ///
    /// # Errors
    ///
    /// See [`check_gadget_or_kernel`].
    pub fn check_install(&self, snap: &snaps::SnapInfo) -> Result<(), DeviceError> {
        self.state.with(|st| {
            let db = self.db.lock().unwrap();
            install::check_gadget_or_kernel(st, &db, &self.config, snap)
        })
    }

    /// Load the device key referenced by the identity; used by tests and
    /// the session-request path.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotReady`] when no key was generated yet.
    pub fn device_key(&self) -> Result<DeviceKey, DeviceError> {
        let identity = self.state.with(|st| view::device(st))?;
        handlers::device_key(&self.keypair_mgr, &identity)
    }
}

/// Whether a non-ready change of `kind` exists.
fn change_in_flight(st: &State, kind: &str) -> bool {
    st.changes()
        .any(|chg| chg.kind() == kind && !st.change_is_ready(chg))
}
