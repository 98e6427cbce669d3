//! The device manager's task handlers.
//!
//! All three handlers are idempotent: they may be re-dispatched after a
//! crash with partial prior effects visible in the state or in their
//! task scratch, and must converge without repeating acknowledged
//! network work.

use std::sync::{Arc, Mutex};

use ensign_core::asserts::{AssertionType, Database, DeviceKey, FsKeypairManager, KeypairError};
use ensign_core::state::{HandlerOutcome, HandlerResult, TaskHandle};
use tracing::{debug, info};

use super::config::{ManagerConfig, RETRY_INTERVAL, RepeatRequestSerial, serial_request_config};
use super::error::DeviceError;
use super::protocol::{SerialAcquire, get_serial};
use super::view;
use super::StoreClient;

/// Generate the device keypair and record its id, unless one exists.
pub(crate) fn do_generate_device_key(
    t: &TaskHandle,
    keypair_mgr: &FsKeypairManager,
    config: &ManagerConfig,
) -> HandlerResult {
    let mut device = t.with_state(|st| view::device(st))?;
    if !device.key_id.is_empty() {
        // Nothing to do.
        return Ok(HandlerOutcome::Done);
    }

    // Key generation takes a while; the state lock is not held here.
    let key = DeviceKey::generate(config.key_length).map_err(DeviceError::Keypair)?;
    keypair_mgr.put(&key)?;
    debug!(key_id = %key.id(), "generated device key pair");

    device.key_id = key.id().to_string();
    t.with_state(|st| view::set_device(st, &device))?;
    Ok(HandlerOutcome::Done)
}

/// Load the device key referenced by the identity.
pub(crate) fn device_key(
    keypair_mgr: &FsKeypairManager,
    device: &view::DeviceIdentity,
) -> Result<DeviceKey, DeviceError> {
    if device.key_id.is_empty() {
        return Err(DeviceError::NotReady);
    }
    match keypair_mgr.get(&device.key_id) {
        Ok(key) => Ok(key),
        Err(err @ KeypairError::NotFound { .. }) => {
            Err(DeviceError::Internal(format!("cannot read device key pair: {err}")))
        },
        Err(err) => Err(err.into()),
    }
}

/// Obtain the device serial from the device service and record it.
pub(crate) fn do_request_serial(
    t: &TaskHandle,
    keypair_mgr: &FsKeypairManager,
    db: &Arc<Mutex<Database>>,
    store: &Arc<dyn StoreClient>,
    config: &ManagerConfig,
) -> HandlerResult {
    let (cfg, mut device) = t.with_state(|st| -> Result<_, DeviceError> {
        let cfg = serial_request_config(st, config)?;
        let device = view::device(st)?;
        Ok((cfg, device))
    })?;

    // The generate-device-key predecessor must have run already.
    let key = match device_key(keypair_mgr, &device) {
        Ok(key) => key,
        Err(err) if err.is_not_ready() => {
            return Err(DeviceError::Internal("cannot find device key pair".to_string()).into());
        },
        Err(err) => return Err(err.into()),
    };

    // Look for an already stored serial assertion for this key, in case
    // an earlier incarnation crashed after saving it.
    let existing_serial = {
        let db = db.lock().unwrap();
        let serials = db.find_many(
            AssertionType::Serial,
            &[
                ("brand-id", &device.brand),
                ("model", &device.model),
                ("device-key-sha3-384", key.id()),
            ],
        );
        match serials.len() {
            0 => None,
            1 => Some(serials[0].header("serial").unwrap_or_default().to_string()),
            _ => {
                return Err(DeviceError::Internal(
                    "multiple serial assertions for the same device key".to_string(),
                )
                .into());
            },
        }
    };
    if let Some(serial) = existing_serial {
        device.serial = serial;
        t.with_state(|st| view::set_device(st, &device))?;
        return Ok(HandlerOutcome::Done);
    }

    let serial = match get_serial(t, &key, &device, &cfg, config)? {
        SerialAcquire::Accepted => {
            t.log_info("Will poll for device serial assertion in 60 seconds");
            return Ok(HandlerOutcome::Retry {
                after: Some(RETRY_INTERVAL),
            });
        },
        SerialAcquire::Retry => {
            return Ok(HandlerOutcome::Retry {
                after: Some(RETRY_INTERVAL),
            });
        },
        SerialAcquire::RetryNow => return Ok(HandlerOutcome::Retry { after: None }),
        SerialAcquire::Serial(serial) => serial,
    };

    // Best effort: fetch the account key the serial was signed with so
    // the assertion database can resolve its signature chain.
    let signing_key_fetch = serial.as_assertion().sign_key_id().map_or_else(
        || Err("serial assertion carries no signing key id".into()),
        |sign_key_id| store.assertion(AssertionType::AccountKey, &[sign_key_id]),
    );
    match &signing_key_fetch {
        Ok(account_key) => {
            let mut db = db.lock().unwrap();
            if let Err(err) = db.add(account_key.clone()) {
                if !err.is_unaccepted_update() {
                    return Err(DeviceError::Database(err).into());
                }
            }
        },
        Err(err) => debug!("cannot fetch signing key for the serial: {err}"),
    }

    {
        let mut db = db.lock().unwrap();
        if let Err(err) = db.add(serial.as_assertion().clone()) {
            if err.is_unaccepted_update() {
                // Already stored; proceed to record the serial.
            } else if let Err(fetch_err) = signing_key_fetch {
                // The add may have failed for lack of the signing key;
                // retry once the store can provide it.
                t.log_error(format!("cannot fetch signing key for the serial: {fetch_err}"));
                return Ok(HandlerOutcome::Retry {
                    after: Some(RETRY_INTERVAL),
                });
            } else {
                return Err(DeviceError::Database(err).into());
            }
        }
    }

    if config.repeat_request_serial == Some(RepeatRequestSerial::AfterAddSerial) {
        return Ok(HandlerOutcome::Retry { after: None });
    }

    device.serial = serial.serial().to_string();
    t.with_state(|st| view::set_device(st, &device))?;
    info!(brand = %device.brand, model = %device.model, serial = %device.serial,
        "device registered");
    Ok(HandlerOutcome::Done)
}

/// Record that seeding finished.
pub(crate) fn do_mark_seeded(t: &TaskHandle) -> HandlerResult {
    t.with_state(|st| st.set("seeded", &true))?;
    Ok(HandlerOutcome::Done)
}
