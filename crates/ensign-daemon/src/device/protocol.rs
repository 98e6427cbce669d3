//! The two-phase serial registration protocol.
//!
//! Phase one acquires a short-lived request-id from the device service;
//! phase two submits a signed serial-request assertion and decodes the
//! returned serial. The state lock is never held across either HTTP
//! round trip: the handler passes in data read from its own scoped state
//! regions and reports progress back through the task handle.

use std::collections::BTreeMap;
use std::time::Duration;

use ensign_core::asserts::{self, AssertionType, DeviceKey, MEDIA_TYPE};
use ensign_core::state::TaskHandle;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{ManagerConfig, RepeatRequestSerial, SerialRequestConfig, USER_AGENT};
use super::error::DeviceError;
use super::view::DeviceIdentity;

/// Per-call timeout on device-service requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Scratch persisted on a request-serial task.
///
/// Once `serial_request` is set, the identical signed request is
/// resubmitted on every retry until the exchange concludes; once
/// `serial` is set the network part is over and only local stores
/// remain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct SerialSetup {
    #[serde(rename = "serial-request")]
    pub serial_request: String,
    pub serial: String,
}

/// Key of the [`SerialSetup`] scratch on request-serial tasks.
pub(crate) const SERIAL_SETUP_KEY: &str = "serial-setup";

#[derive(Debug, Deserialize)]
struct RequestIdResp {
    #[serde(rename = "request-id")]
    request_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ServerError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_list: Vec<ServerErrorEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerErrorEntry {
    #[serde(default)]
    message: String,
}

/// How one serial acquisition attempt concluded.
pub(crate) enum SerialAcquire {
    /// The validated serial assertion.
    Serial(Box<asserts::Serial>),
    /// The service accepted the request but has not issued the serial
    /// yet; the stored request must be resubmitted later.
    Accepted,
    /// A transient failure, already reported to the task log; retry
    /// after the standard interval.
    Retry,
    /// A crash-injection point was hit; re-dispatch immediately.
    RetryNow,
}

enum Prepared {
    Request(String),
    Retry,
}

enum Submitted {
    Serial(asserts::Serial),
    Accepted,
    Retry,
}

/// Build the message logged for an unexpected device-service status.
///
/// Statuses above 500 are reported as-is (likely temporary); otherwise a
/// JSON error body contributes its `message`, falling back to the first
/// `error_list` entry. All bad statuses lead to a retry.
fn bad_status_message(reason: &str, status: u16, content_type: Option<&str>, body: &[u8]) -> String {
    if status > 500 {
        return format!("{reason}: unexpected status {status}");
    }
    if content_type.is_some_and(|ct| ct.starts_with("application/json")) {
        if let Ok(srv_err) = serde_json::from_slice::<ServerError>(body) {
            let message = if srv_err.message.is_empty() {
                srv_err
                    .error_list
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_default()
            } else {
                srv_err.message
            };
            if !message.is_empty() {
                return format!("{reason}: {message}");
            }
        }
    }
    format!("{reason}: unexpected status {status}")
}

fn retry_bad_status(t: &TaskHandle, reason: &str, resp: reqwest::blocking::Response) {
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().map(|b| b.to_vec()).unwrap_or_default();
    t.log_error(bad_status_message(reason, status, content_type.as_deref(), &body));
}

fn http_client() -> Result<reqwest::blocking::Client, DeviceError> {
    reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| DeviceError::Internal(format!("cannot build HTTP client: {err}")))
}

/// Phase one plus signing: fetch a request-id and build the signed
/// serial-request assertion.
fn prepare_serial_request(
    t: &TaskHandle,
    key: &DeviceKey,
    device: &DeviceIdentity,
    client: &reqwest::blocking::Client,
    cfg: &SerialRequestConfig,
) -> Result<Prepared, DeviceError> {
    let req = cfg.apply_headers(client.post(&cfg.request_id_url));
    let resp = match req.send() {
        Ok(resp) => resp,
        Err(err) => {
            t.log_error(format!(
                "cannot retrieve request-id for making a request for a serial: {err}"
            ));
            return Ok(Prepared::Retry);
        },
    };
    if resp.status().as_u16() != 200 {
        retry_bad_status(
            t,
            "cannot retrieve request-id for making a request for a serial",
            resp,
        );
        return Ok(Prepared::Retry);
    }
    let request_id: RequestIdResp = match resp.json() {
        Ok(body) => body,
        Err(err) => {
            // Assume broken I/O rather than a protocol violation.
            t.log_error(format!(
                "cannot read response with request-id for making a request for a serial: {err}"
            ));
            return Ok(Prepared::Retry);
        },
    };

    let encoded_pub_key = key.public_key_pem().map_err(|err| {
        DeviceError::Internal(format!("cannot encode device public key: {err}"))
    })?;

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("brand-id".to_string(), device.brand.clone());
    headers.insert("model".to_string(), device.model.clone());
    headers.insert("request-id".to_string(), request_id.request_id);
    headers.insert(
        "device-key".to_string(),
        encoded_pub_key.trim_end().to_string(),
    );
    if !cfg.proposed_serial.is_empty() {
        headers.insert("serial".to_string(), cfg.proposed_serial.clone());
    }

    let serial_request =
        asserts::sign_without_authority(AssertionType::SerialRequest, headers, &cfg.body, key)?;

    Ok(Prepared::Request(serial_request.encode()))
}

/// Phase two: submit the signed serial-request and decode the response.
fn submit_serial_request(
    t: &TaskHandle,
    serial_request: &str,
    client: &reqwest::blocking::Client,
    cfg: &SerialRequestConfig,
) -> Result<Submitted, DeviceError> {
    let req = cfg
        .apply_headers(client.post(&cfg.serial_request_url))
        .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE)
        .body(serial_request.to_string());
    let resp = match req.send() {
        Ok(resp) => resp,
        Err(err) => {
            t.log_error(format!("cannot deliver device serial request: {err}"));
            return Ok(Submitted::Retry);
        },
    };

    match resp.status().as_u16() {
        200 | 201 => {},
        202 => return Ok(Submitted::Accepted),
        _ => {
            retry_bad_status(t, "cannot deliver device serial request", resp);
            return Ok(Submitted::Retry);
        },
    }

    let body = match resp.text() {
        Ok(body) => body,
        Err(err) => {
            t.log_error(format!("cannot read response to request for a serial: {err}"));
            return Ok(Submitted::Retry);
        },
    };
    let assertion = match asserts::Assertion::decode(&body) {
        Ok(assertion) => assertion,
        Err(err) => {
            t.log_error(format!("cannot read response to request for a serial: {err}"));
            return Ok(Submitted::Retry);
        },
    };
    let typ = assertion.assertion_type();
    let serial = asserts::Serial::try_from_assertion(assertion).map_err(|_| {
        DeviceError::Protocol(format!("cannot use device serial assertion of type {typ}"))
    })?;

    Ok(Submitted::Serial(serial))
}

/// Run the serial exchange, resuming from whatever the task already
/// persisted.
///
/// Until the service has at least accepted a request, each attempt
/// acquires a fresh request-id: a previously minted one may have
/// expired. After a 202 the stored signed request is resubmitted
/// verbatim.
pub(crate) fn get_serial(
    t: &TaskHandle,
    key: &DeviceKey,
    device: &DeviceIdentity,
    cfg: &SerialRequestConfig,
    manager_cfg: &ManagerConfig,
) -> Result<SerialAcquire, DeviceError> {
    let mut setup: SerialSetup = match t.get(SERIAL_SETUP_KEY) {
        Ok(setup) => setup,
        Err(err) if err.is_no_state() => SerialSetup::default(),
        Err(err) => return Err(err.into()),
    };

    if !setup.serial.is_empty() {
        // We got a serial, just did not manage to save its info yet.
        let assertion = asserts::Assertion::decode(&setup.serial).map_err(|err| {
            DeviceError::Internal(format!("cannot decode previously saved serial: {err}"))
        })?;
        let serial = asserts::Serial::try_from_assertion(assertion).map_err(|err| {
            DeviceError::Internal(format!("cannot decode previously saved serial: {err}"))
        })?;
        return Ok(SerialAcquire::Serial(Box::new(serial)));
    }

    if t.aborted() {
        return Ok(SerialAcquire::Retry);
    }

    let client = http_client()?;

    if setup.serial_request.is_empty() {
        match prepare_serial_request(t, key, device, &client, cfg)? {
            Prepared::Request(request) => setup.serial_request = request,
            Prepared::Retry => return Ok(SerialAcquire::Retry),
        }
    }

    if t.aborted() {
        return Ok(SerialAcquire::Retry);
    }

    let serial = match submit_serial_request(t, &setup.serial_request, &client, cfg)? {
        Submitted::Accepted => {
            // Reuse the very same signed request when polling.
            t.set(SERIAL_SETUP_KEY, &setup)?;
            return Ok(SerialAcquire::Accepted);
        },
        Submitted::Retry => return Ok(SerialAcquire::Retry),
        Submitted::Serial(serial) => serial,
    };

    let device_key_id = serial.device_key_id()?;
    if serial.brand_id() != device.brand
        || serial.model() != device.model
        || device_key_id != key.id()
    {
        return Err(DeviceError::Protocol(format!(
            "obtained serial assertion does not match provided device identity information \
             (brand, model, key id): {} / {} / {} != {} / {} / {}",
            serial.brand_id(),
            serial.model(),
            device_key_id,
            device.brand,
            device.model,
            key.id()
        )));
    }

    setup.serial = serial.as_assertion().encode();
    t.set(SERIAL_SETUP_KEY, &setup)?;
    debug!(serial = %serial.serial(), "obtained device serial");

    if manager_cfg.repeat_request_serial == Some(RepeatRequestSerial::AfterGotSerial) {
        return Ok(SerialAcquire::RetryNow);
    }

    Ok(SerialAcquire::Serial(Box::new(serial)))
}
