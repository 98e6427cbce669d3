//! Device manager error types.

use ensign_core::asserts::{AssertError, DatabaseError, KeypairError};
use ensign_core::state::StateError;
use thiserror::Error;

/// Errors from device manager operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// The device identity (or a required assertion) is not established
    /// yet.
    #[error("device identity is not ready")]
    NotReady,

    /// A violated invariant: a prerequisite the task ordering guarantees
    /// is missing, or the stored state is inconsistent.
    #[error("internal error: {0}")]
    Internal(String),

    /// The device service answered with something inconsistent with the
    /// submitted request.
    #[error("{0}")]
    Protocol(String),

    /// Device-service or registration configuration is unusable.
    #[error("{0}")]
    Config(String),

    /// A gadget or kernel snap may not be installed.
    #[error("{0}")]
    Install(String),

    /// Recording boot status failed.
    #[error("{0}")]
    Boot(String),

    /// Loading the system seed failed.
    #[error("{0}")]
    Seed(String),

    /// State access failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Assertion encoding or validation failed.
    #[error(transparent)]
    Asserts(#[from] AssertError),

    /// Device key generation or storage failed.
    #[error(transparent)]
    Keypair(#[from] KeypairError),

    /// Assertion database operation failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl DeviceError {
    /// Whether this error means "not established yet" rather than a
    /// failure.
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }
}

/// The accumulated errors of one ensure cycle.
#[derive(Debug)]
pub struct EnsureError {
    /// The errors of the individual ensure goals.
    pub errors: Vec<DeviceError>,
}

impl std::error::Error for EnsureError {}

impl std::fmt::Display for EnsureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "devicemgr: {}", self.errors[0]);
        }
        write!(f, "devicemgr:")?;
        for err in &self.errors {
            write!(f, "\n - {err}")?;
        }
        Ok(())
    }
}
