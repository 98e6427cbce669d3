//! Manager configuration and the per-attempt serial-request config.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ensign_core::state::{ConfigTransaction, State};

use super::error::DeviceError;
use crate::snaps;

/// Modulus size of generated device keys.
pub const DEFAULT_KEY_LENGTH: usize = 4096;

/// Holdoff before a task retries after a transient failure or an
/// accepted-but-pending serial request.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// User agent sent on device-service requests.
pub(crate) const USER_AGENT: &str = concat!("ensign/", env!("CARGO_PKG_VERSION"));

const PRODUCTION_API_BASE: &str = "https://myapps.developer.ubuntu.com/identity/api/v1/";
const STAGING_API_BASE: &str = "https://myapps.developer.staging.ubuntu.com/identity/api/v1/";

/// Environment variable switching the default device service to staging.
pub const STAGING_ENV: &str = "SNAPPY_USE_STAGING_STORE";

/// Crash-injection points of the request-serial handler, used by tests to
/// exercise resumption from a later incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatRequestSerial {
    /// Return an immediate retry after the serial was received and
    /// persisted in the task scratch.
    AfterGotSerial,
    /// Return an immediate retry after the serial assertion was added to
    /// the database.
    AfterAddSerial,
}

/// Configuration of a [`DeviceManager`](super::DeviceManager) instance.
///
/// Process-wide knobs (the staging toggle, the operational attempt
/// counter, the request-serial crash injection) live here instead of in
/// globals, so concurrent managers in tests do not interfere.
#[derive(Debug)]
pub struct ManagerConfig {
    /// The series this image tracks.
    pub series: String,
    /// Whether this is a classic system (no model-mandated kernel).
    pub on_classic: bool,
    /// Whether to register against the staging device service.
    pub use_staging: bool,
    /// Directory holding the device keypairs.
    pub device_key_dir: PathBuf,
    /// Modulus size for generated device keys.
    pub key_length: usize,
    /// Crash-injection point for the request-serial handler, if any.
    pub repeat_request_serial: Option<RepeatRequestSerial>,
    attempts: AtomicU32,
}

impl ManagerConfig {
    /// Create a configuration with defaults, keys stored under
    /// `device_key_dir`.
    #[must_use]
    pub fn new(device_key_dir: impl Into<PathBuf>) -> Self {
        Self {
            series: "16".to_string(),
            on_classic: false,
            use_staging: false,
            device_key_dir: device_key_dir.into(),
            key_length: DEFAULT_KEY_LENGTH,
            repeat_request_serial: None,
            attempts: AtomicU32::new(0),
        }
    }

    /// Create a configuration with the staging toggle read from the
    /// environment.
    #[must_use]
    pub fn from_env(device_key_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(device_key_dir);
        config.use_staging = std::env::var(STAGING_ENV)
            .map(|v| truthy(&v))
            .unwrap_or(false);
        config
    }

    /// The device-service API base for this configuration.
    #[must_use]
    pub fn api_base(&self) -> &'static str {
        if self.use_staging {
            STAGING_API_BASE
        } else {
            PRODUCTION_API_BASE
        }
    }

    fn default_request_id_url(&self) -> String {
        format!("{}request-id", self.api_base())
    }

    fn default_serial_request_url(&self) -> String {
        format!("{}devices", self.api_base())
    }

    /// Count one full become-operational attempt.
    pub fn inc_operational_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// How many become-operational attempts have been made.
    #[must_use]
    pub fn operational_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes" | "on"
    )
}

/// Where and how to talk to the device service for one registration
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SerialRequestConfig {
    pub request_id_url: String,
    pub serial_request_url: String,
    pub headers: BTreeMap<String, String>,
    pub proposed_serial: String,
    pub body: Vec<u8>,
}

impl SerialRequestConfig {
    pub(crate) fn apply_headers(
        &self,
        mut req: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }
}

/// Resolve the serial-request configuration from the gadget snap's
/// configuration, falling back to the built-in device service.
pub(crate) fn serial_request_config(
    st: &State,
    config: &ManagerConfig,
) -> Result<SerialRequestConfig, DeviceError> {
    let gadget = snaps::gadget_info(st)
        .map_err(|err| DeviceError::Config(format!("cannot find gadget snap and its name: {err}")))?;

    let tr = ConfigTransaction::new(st);
    let svc_url: Option<String> = tr.get_maybe(&gadget.name, "device-service.url")?;

    let Some(svc_url) = svc_url.filter(|u| !u.is_empty()) else {
        return Ok(SerialRequestConfig {
            request_id_url: config.default_request_id_url(),
            serial_request_url: config.default_serial_request_url(),
            headers: BTreeMap::new(),
            proposed_serial: String::new(),
            body: Vec::new(),
        });
    };

    let base_url = reqwest::Url::parse(&svc_url).map_err(|err| {
        DeviceError::Config(format!(
            "cannot parse device registration base URL {svc_url:?}: {err}"
        ))
    })?;
    let request_id_url = base_url
        .join("request-id")
        .map_err(|err| DeviceError::Config(format!("cannot build request-id URL from {base_url}: {err}")))?;
    let serial_request_url = base_url
        .join("serial")
        .map_err(|err| DeviceError::Config(format!("cannot build serial URL from {base_url}: {err}")))?;

    let headers: Option<BTreeMap<String, String>> =
        tr.get_maybe(&gadget.name, "device-service.headers")?;
    let body: Option<String> = tr.get_maybe(&gadget.name, "registration.body")?;
    let proposed_serial: Option<String> =
        tr.get_maybe(&gadget.name, "registration.proposed-serial")?;

    Ok(SerialRequestConfig {
        request_id_url: request_id_url.to_string(),
        serial_request_url: serial_request_url.to_string(),
        headers: headers.unwrap_or_default(),
        proposed_serial: proposed_serial.unwrap_or_default(),
        body: body.unwrap_or_default().into_bytes(),
    })
}
