//! Snap metadata read from the shared state.
//!
//! The snap lifecycle itself is managed elsewhere; the device manager
//! only needs to know whether a gadget or kernel snap is present, the
//! gadget's name and which hooks it declares.

use std::collections::BTreeSet;

use ensign_core::state::{State, StateError};
use serde::{Deserialize, Serialize};

/// The role a snap plays on the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapType {
    /// An application snap.
    App,
    /// The per-model gadget snap.
    Gadget,
    /// The kernel snap.
    Kernel,
    /// The base OS snap.
    Os,
}

/// Metadata of an installed (or to-be-installed) snap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    /// The snap name.
    pub name: String,
    /// The snap's role.
    #[serde(rename = "type")]
    pub snap_type: SnapType,
    /// The store-assigned snap id; empty for unasserted snaps.
    #[serde(default)]
    pub snap_id: String,
    /// The hooks the snap declares.
    #[serde(default)]
    pub hooks: BTreeSet<String>,
}

/// Read the installed gadget snap's metadata.
///
/// # Errors
///
/// Returns [`StateError::NoState`] when no gadget snap is installed yet.
pub fn gadget_info(st: &State) -> Result<SnapInfo, StateError> {
    st.get("gadget")
}

/// Record the installed gadget snap's metadata.
///
/// # Errors
///
/// Returns an encode error when the metadata cannot be serialized.
pub fn set_gadget_info(st: &mut State, info: &SnapInfo) -> Result<(), StateError> {
    st.set("gadget", info)
}

/// Read the installed kernel snap's metadata.
///
/// # Errors
///
/// Returns [`StateError::NoState`] when no kernel snap is installed yet.
pub fn kernel_info(st: &State) -> Result<SnapInfo, StateError> {
    st.get("kernel")
}

/// Record the installed kernel snap's metadata.
///
/// # Errors
///
/// Returns an encode error when the metadata cannot be serialized.
pub fn set_kernel_info(st: &mut State, info: &SnapInfo) -> Result<(), StateError> {
    st.set("kernel", info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gadget_info_round_trips() {
        let mut st = State::new();
        assert!(gadget_info(&st).unwrap_err().is_no_state());

        let info = SnapInfo {
            name: "pc".to_string(),
            snap_type: SnapType::Gadget,
            snap_id: "pcsnapid".to_string(),
            hooks: ["prepare-device".to_string()].into(),
        };
        set_gadget_info(&mut st, &info).unwrap();
        assert_eq!(gadget_info(&st).unwrap(), info);
    }
}
