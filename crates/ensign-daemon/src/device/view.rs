//! The device identity stored in the state, and its assertion lookups.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use ensign_core::asserts::{self, AssertionType, Database, DeviceKey};
use ensign_core::state::State;
use serde::{Deserialize, Serialize};

use super::error::DeviceError;

/// The device's identity tuple, stored under the `device` state entry.
///
/// Fields are filled in over the device's first-boot sequence: brand and
/// model at seed time, the key id by `generate-device-key` and the serial
/// by `request-serial`. A non-empty serial implies all other fields are
/// set and a matching serial assertion is in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    /// The brand account id, from the seeded model.
    pub brand: String,
    /// The model name, from the seeded model.
    pub model: String,
    /// The device public-key id, set once by key generation.
    #[serde(rename = "key-id")]
    pub key_id: String,
    /// The device serial, set once registration completed.
    pub serial: String,
}

/// Read the device identity, defaulting to an empty identity when none
/// is stored yet.
///
/// # Errors
///
/// Returns a decode error when the stored entry is corrupt.
pub fn device(st: &State) -> Result<DeviceIdentity, DeviceError> {
    match st.get("device") {
        Ok(identity) => Ok(identity),
        Err(err) if err.is_no_state() => Ok(DeviceIdentity::default()),
        Err(err) => Err(err.into()),
    }
}

/// Store the device identity.
///
/// # Errors
///
/// Returns an encode error when the identity cannot be serialized.
pub fn set_device(st: &mut State, identity: &DeviceIdentity) -> Result<(), DeviceError> {
    st.set("device", identity)?;
    Ok(())
}

/// The signed model assertion for the device's (series, brand, model).
///
/// # Errors
///
/// Returns [`DeviceError::NotReady`] when brand or model are unset or
/// the assertion is not in the database.
pub fn model(st: &State, db: &Database, series: &str) -> Result<asserts::Model, DeviceError> {
    let identity = device(st)?;
    if identity.brand.is_empty() || identity.model.is_empty() {
        return Err(DeviceError::NotReady);
    }
    let assertion = db
        .find(
            AssertionType::Model,
            &[
                ("series", series),
                ("brand-id", &identity.brand),
                ("model", &identity.model),
            ],
        )
        .map_err(|err| {
            if err.is_not_found() {
                DeviceError::NotReady
            } else {
                err.into()
            }
        })?;
    Ok(asserts::Model::try_from_assertion(assertion.clone())?)
}

/// The signed serial assertion for the device's (brand, model, serial).
///
/// # Errors
///
/// Returns [`DeviceError::NotReady`] when the serial is unset or the
/// assertion is not in the database.
pub fn serial(st: &State, db: &Database) -> Result<asserts::Serial, DeviceError> {
    let identity = device(st)?;
    if identity.serial.is_empty() {
        return Err(DeviceError::NotReady);
    }
    let assertion = db
        .find(
            AssertionType::Serial,
            &[
                ("brand-id", &identity.brand),
                ("model", &identity.model),
                ("serial", &identity.serial),
            ],
        )
        .map_err(|err| {
            if err.is_not_found() {
                DeviceError::NotReady
            } else {
                err.into()
            }
        })?;
    Ok(asserts::Serial::try_from_assertion(assertion.clone())?)
}

/// Sign a device-session-request for `nonce` with the device key.
pub(crate) fn device_session_request(
    serial: &asserts::Serial,
    key: &DeviceKey,
    nonce: &str,
) -> Result<asserts::DeviceSessionRequest, DeviceError> {
    let headers: BTreeMap<String, String> = [
        ("brand-id", serial.brand_id()),
        ("model", serial.model()),
        ("serial", serial.serial()),
        ("nonce", nonce),
        (
            "timestamp",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let assertion = asserts::sign_without_authority(
        AssertionType::DeviceSessionRequest,
        headers,
        b"",
        key,
    )?;
    Ok(asserts::DeviceSessionRequest::try_from_assertion(assertion)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_defaults_to_empty() {
        let st = State::new();
        let identity = device(&st).unwrap();
        assert_eq!(identity, DeviceIdentity::default());
    }

    #[test]
    fn identity_round_trips() {
        let mut st = State::new();
        let identity = DeviceIdentity {
            brand: "canonical".to_string(),
            model: "pc".to_string(),
            key_id: "KEYID".to_string(),
            serial: "42".to_string(),
        };
        set_device(&mut st, &identity).unwrap();
        assert_eq!(device(&st).unwrap(), identity);
    }

    #[test]
    fn model_without_identity_is_not_ready() {
        let st = State::new();
        let db = Database::new();
        assert!(model(&st, &db, "16").unwrap_err().is_not_ready());
    }

    #[test]
    fn serial_without_serial_field_is_not_ready() {
        let mut st = State::new();
        let db = Database::new();
        set_device(
            &mut st,
            &DeviceIdentity {
                brand: "canonical".to_string(),
                model: "pc".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(serial(&st, &db).unwrap_err().is_not_ready());
    }

    #[test]
    fn model_missing_in_db_is_not_ready() {
        let mut st = State::new();
        let db = Database::new();
        set_device(
            &mut st,
            &DeviceIdentity {
                brand: "canonical".to_string(),
                model: "pc".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(model(&st, &db, "16").unwrap_err().is_not_ready());
    }

    #[test]
    fn session_request_carries_identity_and_nonce() {
        let key = DeviceKey::generate(1024).unwrap();
        let pem = key.public_key_pem().unwrap();
        let headers: BTreeMap<String, String> = [
            ("brand-id", "canonical"),
            ("model", "pc"),
            ("serial", "42"),
            ("device-key", pem.trim_end()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let serial_assertion = asserts::Serial::try_from_assertion(
            asserts::sign_without_authority(AssertionType::Serial, headers, b"", &key).unwrap(),
        )
        .unwrap();

        let session = device_session_request(&serial_assertion, &key, "NONCE-1").unwrap();
        let a = session.as_assertion();
        assert_eq!(a.header("brand-id"), Some("canonical"));
        assert_eq!(a.header("model"), Some("pc"));
        assert_eq!(a.header("serial"), Some("42"));
        assert_eq!(a.header("nonce"), Some("NONCE-1"));
        assert!(a.header("timestamp").is_some());
    }
}
