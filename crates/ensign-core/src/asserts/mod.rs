//! Assertions: signed statements exchanged with the device service.
//!
//! An assertion is a block of sorted `name: value` headers, an optional
//! opaque body and a signature line. Multi-line header values indent
//! their continuation lines by four spaces. Signature *verification* is
//! the concern of the authority infrastructure, not of this crate;
//! decoding checks structure only.

mod database;
mod keypair;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use database::{Database, DatabaseError};
pub use keypair::{DeviceKey, FsKeypairManager, KeypairError, key_id_for_public_pem};

/// The assertion media type used on the wire.
pub const MEDIA_TYPE: &str = "application/x.ubuntu.assertion";

/// Header carrying the id of the key an assertion was signed with.
pub const SIGN_KEY_HEADER: &str = "sign-key-sha3-384";

const CONTINUATION: &str = "    ";

/// Errors from assertion encoding, decoding and signing.
#[derive(Debug, Error)]
pub enum AssertError {
    /// The `type` header names no known assertion type.
    #[error("unknown assertion type: {value}")]
    UnknownType {
        /// The unrecognized type name.
        value: String,
    },

    /// A required header is missing.
    #[error("assertion {typ} header missing: {header}")]
    MissingHeader {
        /// The assertion type.
        typ: AssertionType,
        /// The missing header name.
        header: &'static str,
    },

    /// The assertion has a different type than expected.
    #[error("expected {expected} assertion, got {actual}")]
    WrongType {
        /// The expected type.
        expected: AssertionType,
        /// The actual type.
        actual: AssertionType,
    },

    /// The raw text does not parse as an assertion.
    #[error("cannot parse assertion: {reason}")]
    Malformed {
        /// Why parsing failed.
        reason: String,
    },

    /// Signing failed.
    #[error(transparent)]
    Signing(#[from] KeypairError),
}

/// The known assertion types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum AssertionType {
    /// Binds an account's public signing key to its id.
    AccountKey,
    /// A device's signed request for a store session.
    DeviceSessionRequest,
    /// Binds (series, brand, model) to the model's required snaps.
    Model,
    /// Binds a device public key to a serial within (brand, model).
    Serial,
    /// A device's signed request for a serial.
    SerialRequest,
    /// Binds a snap id to its name and publisher.
    SnapDeclaration,
}

impl AssertionType {
    /// The wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccountKey => "account-key",
            Self::DeviceSessionRequest => "device-session-request",
            Self::Model => "model",
            Self::Serial => "serial",
            Self::SerialRequest => "serial-request",
            Self::SnapDeclaration => "snap-declaration",
        }
    }

    /// The headers forming the primary key of this type.
    #[must_use]
    pub const fn primary_key(self) -> &'static [&'static str] {
        match self {
            Self::AccountKey => &["public-key-sha3-384"],
            Self::DeviceSessionRequest => &["brand-id", "model", "serial", "nonce"],
            Self::Model => &["series", "brand-id", "model"],
            Self::Serial => &["brand-id", "model", "serial"],
            Self::SerialRequest => &["brand-id", "model", "request-id"],
            Self::SnapDeclaration => &["series", "snap-id"],
        }
    }
}

impl fmt::Display for AssertionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssertionType {
    type Err = AssertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account-key" => Ok(Self::AccountKey),
            "device-session-request" => Ok(Self::DeviceSessionRequest),
            "model" => Ok(Self::Model),
            "serial" => Ok(Self::Serial),
            "serial-request" => Ok(Self::SerialRequest),
            "snap-declaration" => Ok(Self::SnapDeclaration),
            _ => Err(AssertError::UnknownType {
                value: s.to_string(),
            }),
        }
    }
}

/// A decoded assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    typ: AssertionType,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    signature: String,
}

impl Assertion {
    /// The assertion type.
    #[must_use]
    pub const fn assertion_type(&self) -> AssertionType {
        self.typ
    }

    /// Read a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The opaque body, empty when absent.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The id of the key this assertion was signed with, when recorded.
    #[must_use]
    pub fn sign_key_id(&self) -> Option<&str> {
        self.header(SIGN_KEY_HEADER)
    }

    /// Serialize to the wire format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value.replace('\n', &format!("\n{CONTINUATION}")));
            out.push('\n');
        }
        out.push('\n');
        if !self.body.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.body));
            out.push_str("\n\n");
        }
        out.push_str(&self.signature);
        out.push('\n');
        out
    }

    /// Parse an assertion from its wire format.
    ///
    /// # Errors
    ///
    /// Returns [`AssertError::Malformed`] on structural problems and
    /// [`AssertError::UnknownType`] for unrecognized types.
    pub fn decode(text: &str) -> Result<Self, AssertError> {
        let malformed = |reason: &str| AssertError::Malformed {
            reason: reason.to_string(),
        };

        // Continuation lines are indented and never empty, so the first
        // blank line terminates the header block.
        let (header_text, rest) = text
            .split_once("\n\n")
            .ok_or_else(|| malformed("missing header terminator"))?;

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut last_header: Option<String> = None;
        for line in header_text.lines() {
            if let Some(continuation) = line.strip_prefix(CONTINUATION) {
                let value = last_header
                    .as_ref()
                    .and_then(|name| headers.get_mut(name))
                    .ok_or_else(|| malformed("continuation line before any header"))?;
                value.push('\n');
                value.push_str(continuation);
                continue;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| malformed("header line without separator"))?;
            headers.insert(name.to_string(), value.to_string());
            last_header = Some(name.to_string());
        }
        if headers.is_empty() {
            return Err(malformed("no headers"));
        }

        let typ: AssertionType = headers
            .get("type")
            .ok_or_else(|| malformed("missing type header"))?
            .parse()?;

        let body_length: usize = headers
            .get("body-length")
            .map(|v| v.parse().map_err(|_| malformed("invalid body-length")))
            .transpose()?
            .unwrap_or(0);

        let (body, signature_text) = if body_length > 0 {
            if rest.len() < body_length || !rest.is_char_boundary(body_length) {
                return Err(malformed("body shorter than body-length"));
            }
            let (body, after) = rest.split_at(body_length);
            let after = after
                .strip_prefix("\n\n")
                .ok_or_else(|| malformed("missing body terminator"))?;
            (body.as_bytes().to_vec(), after)
        } else {
            (Vec::new(), rest)
        };
        let signature = signature_text.trim();
        if signature.is_empty() {
            return Err(malformed("missing signature"));
        }
        let signature = signature.to_string();

        Ok(Self {
            typ,
            headers,
            body,
            signature,
        })
    }
}

/// Sign an assertion with a device key, without an authority.
///
/// Device-signed assertions (serial-request, device-session-request) are
/// self-signed: no `authority-id` is set and [`SIGN_KEY_HEADER`] records
/// the signing key id.
///
/// # Errors
///
/// Returns [`AssertError::Signing`] when the signature operation fails.
pub fn sign_without_authority(
    typ: AssertionType,
    headers: BTreeMap<String, String>,
    body: &[u8],
    key: &DeviceKey,
) -> Result<Assertion, AssertError> {
    let mut headers = headers;
    headers.insert("type".to_string(), typ.as_str().to_string());
    headers.insert(SIGN_KEY_HEADER.to_string(), key.id().to_string());
    if !body.is_empty() {
        headers.insert("body-length".to_string(), body.len().to_string());
    }

    let mut assertion = Assertion {
        typ,
        headers,
        body: body.to_vec(),
        signature: String::new(),
    };
    let content = assertion.encode();
    assertion.signature = key.sign(content.as_bytes())?;
    Ok(assertion)
}

fn required_header<'a>(
    assertion: &'a Assertion,
    header: &'static str,
) -> Result<&'a str, AssertError> {
    assertion.header(header).ok_or(AssertError::MissingHeader {
        typ: assertion.assertion_type(),
        header,
    })
}

fn check_type(assertion: &Assertion, expected: AssertionType) -> Result<(), AssertError> {
    if assertion.assertion_type() != expected {
        return Err(AssertError::WrongType {
            expected,
            actual: assertion.assertion_type(),
        });
    }
    Ok(())
}

macro_rules! assertion_wrapper {
    ($(#[$doc:meta])* $name:ident, $typ:expr, required: [$($req:literal),*]) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(Assertion);

        impl $name {
            /// Validate and wrap a decoded assertion.
            ///
            /// # Errors
            ///
            /// Returns [`AssertError::WrongType`] for a different
            /// assertion type and [`AssertError::MissingHeader`] when a
            /// required header is absent.
            pub fn try_from_assertion(assertion: Assertion) -> Result<Self, AssertError> {
                check_type(&assertion, $typ)?;
                $(required_header(&assertion, $req)?;)*
                Ok(Self(assertion))
            }

            /// The underlying assertion.
            #[must_use]
            pub const fn as_assertion(&self) -> &Assertion {
                &self.0
            }

            /// Unwrap into the underlying assertion.
            #[must_use]
            pub fn into_assertion(self) -> Assertion {
                self.0
            }
        }
    };
}

assertion_wrapper!(
    /// A model assertion: the signed definition of a device model.
    Model, AssertionType::Model, required: ["series", "brand-id", "model"]
);

impl Model {
    /// The series the model belongs to.
    #[must_use]
    pub fn series(&self) -> &str {
        self.0.header("series").unwrap_or_default()
    }

    /// The brand account id.
    #[must_use]
    pub fn brand_id(&self) -> &str {
        self.0.header("brand-id").unwrap_or_default()
    }

    /// The model name.
    #[must_use]
    pub fn model(&self) -> &str {
        self.0.header("model").unwrap_or_default()
    }

    /// The gadget snap the model mandates, empty when none.
    #[must_use]
    pub fn gadget(&self) -> &str {
        self.0.header("gadget").unwrap_or_default()
    }

    /// The kernel snap the model mandates, empty when none.
    #[must_use]
    pub fn kernel(&self) -> &str {
        self.0.header("kernel").unwrap_or_default()
    }
}

assertion_wrapper!(
    /// A serial assertion: the device service's signed statement binding a
    /// device key to a serial.
    Serial, AssertionType::Serial, required: ["brand-id", "model", "serial", "device-key"]
);

impl Serial {
    /// The brand account id.
    #[must_use]
    pub fn brand_id(&self) -> &str {
        self.0.header("brand-id").unwrap_or_default()
    }

    /// The model name.
    #[must_use]
    pub fn model(&self) -> &str {
        self.0.header("model").unwrap_or_default()
    }

    /// The assigned serial.
    #[must_use]
    pub fn serial(&self) -> &str {
        self.0.header("serial").unwrap_or_default()
    }

    /// The armoured device public key the serial is bound to.
    #[must_use]
    pub fn device_key(&self) -> &str {
        self.0.header("device-key").unwrap_or_default()
    }

    /// The id of the bound device key.
    ///
    /// Uses the `device-key-sha3-384` header when present, otherwise
    /// computes the id from the armoured key.
    ///
    /// # Errors
    ///
    /// Returns [`AssertError::Signing`] when the armoured key does not
    /// parse.
    pub fn device_key_id(&self) -> Result<String, AssertError> {
        if let Some(id) = self.0.header("device-key-sha3-384") {
            return Ok(id.to_string());
        }
        Ok(key_id_for_public_pem(self.device_key())?)
    }
}

assertion_wrapper!(
    /// A serial-request assertion: the device's signed request for a
    /// serial.
    SerialRequest, AssertionType::SerialRequest,
    required: ["brand-id", "model", "request-id", "device-key"]
);

assertion_wrapper!(
    /// A device-session-request assertion: the device's signed request
    /// for a store session.
    DeviceSessionRequest, AssertionType::DeviceSessionRequest,
    required: ["brand-id", "model", "serial", "nonce", "timestamp"]
);

assertion_wrapper!(
    /// An account-key assertion: an account's published signing key.
    AccountKey, AssertionType::AccountKey, required: ["public-key-sha3-384"]
);

assertion_wrapper!(
    /// A snap-declaration assertion: a snap id bound to its name and
    /// publisher.
    SnapDeclaration, AssertionType::SnapDeclaration,
    required: ["series", "snap-id", "snap-name", "publisher-id"]
);

impl SnapDeclaration {
    /// The declared snap name.
    #[must_use]
    pub fn snap_name(&self) -> &str {
        self.0.header("snap-name").unwrap_or_default()
    }

    /// The publisher account id.
    #[must_use]
    pub fn publisher_id(&self) -> &str {
        self.0.header("publisher-id").unwrap_or_default()
    }
}
