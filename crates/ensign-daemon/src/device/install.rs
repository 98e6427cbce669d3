//! Install checks for gadget and kernel snaps.
//!
//! Gadget and kernel snaps define the device; installs must match what
//! the model assertion mandates, and their publisher must be the brand
//! (or canonical) when the snap is asserted.

use ensign_core::asserts::{AssertionType, Database, SnapDeclaration};
use ensign_core::state::State;
use tracing::info;

use super::config::ManagerConfig;
use super::error::DeviceError;
use super::view;
use crate::snaps::{self, SnapInfo, SnapType};

/// Refuse gadget or kernel installs that contradict the model.
///
/// Other snap types pass unchecked. A kernel install on a classic system
/// is always refused.
///
/// # Errors
///
/// Returns [`DeviceError::Install`] when the install must be refused and
/// [`DeviceError::Internal`] when a declared snap lacks its declaration.
pub fn check_gadget_or_kernel(
    st: &State,
    db: &Database,
    config: &ManagerConfig,
    snap: &SnapInfo,
) -> Result<(), DeviceError> {
    let kind = match snap.snap_type {
        SnapType::Gadget => "gadget",
        SnapType::Kernel => {
            if config.on_classic {
                return Err(DeviceError::Install(
                    "cannot install a kernel snap on classic".to_string(),
                ));
            }
            "kernel"
        },
        _ => return Ok(()),
    };

    let model = view::model(st, db, &config.series).map_err(|err| {
        if err.is_not_ready() {
            DeviceError::Install(format!("cannot install {kind} without model assertion"))
        } else {
            err
        }
    })?;

    if snap.snap_id.is_empty() {
        info!(kind, name = %snap.name, "installing unasserted snap");
    } else {
        let declaration = db
            .find(
                AssertionType::SnapDeclaration,
                &[("series", &config.series), ("snap-id", &snap.snap_id)],
            )
            .map_err(|err| {
                DeviceError::Internal(format!(
                    "cannot find snap declaration for {:?}: {err}",
                    snap.name
                ))
            })
            .and_then(|a| {
                SnapDeclaration::try_from_assertion(a.clone()).map_err(|err| {
                    DeviceError::Internal(format!(
                        "cannot find snap declaration for {:?}: {err}",
                        snap.name
                    ))
                })
            })?;
        let publisher = declaration.publisher_id();
        if publisher != "canonical" && publisher != model.brand_id() {
            return Err(DeviceError::Install(format!(
                "cannot install {kind} {:?} published by {:?} for model by {:?}",
                snap.name,
                publisher,
                model.brand_id()
            )));
        }
    }

    let current = match snap.snap_type {
        SnapType::Gadget => snaps::gadget_info(st),
        _ => snaps::kernel_info(st),
    };
    match current {
        Ok(_) => {
            // Already installed; updates are checked elsewhere.
            return Ok(());
        },
        Err(err) if err.is_no_state() => {},
        Err(err) => {
            return Err(DeviceError::Internal(format!(
                "cannot find original {kind} snap: {err}"
            )));
        },
    }

    // First installation of a gadget or kernel.
    let expected = match snap.snap_type {
        SnapType::Gadget => model.gadget(),
        _ => model.kernel(),
    };
    if expected.is_empty() {
        // Can happen only on classic.
        return Err(DeviceError::Install(format!(
            "cannot install {kind} snap on classic if not requested by the model"
        )));
    }
    if snap.name != expected {
        return Err(DeviceError::Install(format!(
            "cannot install {kind} {:?}, model assertion requests {expected:?}",
            snap.name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ensign_core::asserts::{DeviceKey, sign_without_authority};

    use super::super::view::DeviceIdentity;
    use super::*;

    const TEST_KEY_BITS: usize = 1024;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    struct Fixture {
        st: State,
        db: Database,
        config: ManagerConfig,
    }

    fn fixture_with_model(gadget: &str, kernel: &str) -> Fixture {
        let key = DeviceKey::generate(TEST_KEY_BITS).unwrap();
        let mut st = State::new();
        let mut db = Database::new();
        view::set_device(
            &mut st,
            &DeviceIdentity {
                brand: "my-brand".to_string(),
                model: "my-model".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let mut model_headers = headers(&[
            ("series", "16"),
            ("brand-id", "my-brand"),
            ("model", "my-model"),
        ]);
        if !gadget.is_empty() {
            model_headers.insert("gadget".to_string(), gadget.to_string());
        }
        if !kernel.is_empty() {
            model_headers.insert("kernel".to_string(), kernel.to_string());
        }
        db.add(sign_without_authority(AssertionType::Model, model_headers, b"", &key).unwrap())
            .unwrap();
        Fixture {
            st,
            db,
            config: ManagerConfig::new("/tmp/keys"),
        }
    }

    fn gadget(name: &str) -> SnapInfo {
        SnapInfo {
            name: name.to_string(),
            snap_type: SnapType::Gadget,
            snap_id: String::new(),
            hooks: Default::default(),
        }
    }

    fn kernel(name: &str) -> SnapInfo {
        SnapInfo {
            name: name.to_string(),
            snap_type: SnapType::Kernel,
            snap_id: String::new(),
            hooks: Default::default(),
        }
    }

    #[test]
    fn kernel_on_classic_is_always_refused() {
        let mut fx = fixture_with_model("pc", "pc-kernel");
        fx.config.on_classic = true;
        let err = check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &kernel("pc-kernel"))
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot install a kernel snap on classic");

        // The same message regardless of whether a model exists.
        let empty = State::new();
        let err =
            check_gadget_or_kernel(&empty, &Database::new(), &fx.config, &kernel("pc-kernel"))
                .unwrap_err();
        assert_eq!(err.to_string(), "cannot install a kernel snap on classic");
    }

    #[test]
    fn app_snaps_pass_unchecked() {
        let st = State::new();
        let db = Database::new();
        let config = ManagerConfig::new("/tmp/keys");
        let app = SnapInfo {
            name: "hello".to_string(),
            snap_type: SnapType::App,
            snap_id: String::new(),
            hooks: Default::default(),
        };
        check_gadget_or_kernel(&st, &db, &config, &app).unwrap();
    }

    #[test]
    fn gadget_without_model_is_refused() {
        let st = State::new();
        let db = Database::new();
        let config = ManagerConfig::new("/tmp/keys");
        let err = check_gadget_or_kernel(&st, &db, &config, &gadget("pc")).unwrap_err();
        assert_eq!(err.to_string(), "cannot install gadget without model assertion");
    }

    #[test]
    fn first_gadget_must_match_the_model() {
        let fx = fixture_with_model("pc", "pc-kernel");
        check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &gadget("pc")).unwrap();

        let err =
            check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &gadget("other-gadget")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot install gadget \"other-gadget\", model assertion requests \"pc\""
        );
    }

    #[test]
    fn model_without_gadget_name_refuses_first_install() {
        let fx = fixture_with_model("", "");
        let err = check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &gadget("pc")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot install gadget snap on classic if not requested by the model"
        );
    }

    #[test]
    fn installed_gadget_passes() {
        let mut fx = fixture_with_model("pc", "pc-kernel");
        snaps::set_gadget_info(&mut fx.st, &gadget("pc")).unwrap();
        // Even a different name passes once a gadget is installed.
        check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &gadget("other")).unwrap();
    }

    #[test]
    fn asserted_snap_publisher_must_be_brand_or_canonical() {
        let key = DeviceKey::generate(TEST_KEY_BITS).unwrap();
        let mut fx = fixture_with_model("pc", "pc-kernel");
        fx.db
            .add(
                sign_without_authority(
                    AssertionType::SnapDeclaration,
                    headers(&[
                        ("series", "16"),
                        ("snap-id", "pcsnapid"),
                        ("snap-name", "pc"),
                        ("publisher-id", "someone-else"),
                    ]),
                    b"",
                    &key,
                )
                .unwrap(),
            )
            .unwrap();

        let mut snap = gadget("pc");
        snap.snap_id = "pcsnapid".to_string();
        let err = check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &snap).unwrap_err();
        assert!(err.to_string().contains("published by \"someone-else\""));
    }

    #[test]
    fn asserted_snap_without_declaration_is_internal() {
        let fx = fixture_with_model("pc", "pc-kernel");
        let mut snap = gadget("pc");
        snap.snap_id = "pcsnapid".to_string();
        let err = check_gadget_or_kernel(&fx.st, &fx.db, &fx.config, &snap).unwrap_err();
        assert!(matches!(err, DeviceError::Internal(_)));
    }
}
