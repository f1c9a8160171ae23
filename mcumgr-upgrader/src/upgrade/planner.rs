use super::{
    UpgradeMode, clients::SlotReport, error::FirmwareUpgradeError, slate::ImageSlate,
};

/// The next step derived from the device's image inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPlan {
    /// Every image is already where it needs to be.
    Complete,
    /// At least one image is missing on the device and must be uploaded.
    Upload,
    /// The staged image at `slate` must be marked for a test boot.
    Test {
        /// index into the slate list
        slate: usize,
    },
    /// The image at `slate` must be confirmed.
    Confirm {
        /// index into the slate list
        slate: usize,
    },
    /// A foreign confirmed image occupies the staging slot; confirming the
    /// primary hash releases it. Validation runs again afterwards.
    ValidationConfirm {
        /// hash of the primary slot to confirm
        hash: [u8; 32],
    },
    /// The device must reboot to make progress; afterwards the upgrade
    /// continues from its post-reset state.
    Reset,
    /// The device must reboot, and the inventory must be validated again
    /// afterwards.
    ResetAndRevalidate,
}

/// Decides what to do next given the device's inventory and the upgrade's
/// progress so far.
///
/// Iterates the slates in upload order and returns the first decision that
/// requires action. Slates that turn out to be already uploaded or
/// confirmed get their flags raised as a side effect; no commands are
/// issued from here.
pub fn plan(
    report: &SlotReport,
    slates: &mut [ImageSlate],
    mode: UpgradeMode,
) -> Result<ValidationPlan, FirmwareUpgradeError> {
    for (index, slate) in slates.iter_mut().enumerate() {
        let primary = report.slot(slate.image(), 0);
        let secondary = report.slot(slate.image(), 1);

        // the image already runs from the primary slot
        if let Some(primary) = primary {
            if primary.hash == Some(slate.hash()) {
                if primary.confirmed || primary.permanent {
                    slate.mark_confirmed();
                    continue;
                }
                // running, but the device would revert it on reset
                slate.mark_uploaded();
                match mode {
                    UpgradeMode::TestOnly => continue,
                    UpgradeMode::ConfirmOnly | UpgradeMode::TestAndConfirm => {
                        return Ok(ValidationPlan::Confirm { slate: index });
                    }
                }
            }
        }

        let Some(secondary) = secondary else {
            // not on the device at all; upload takes care of it
            continue;
        };

        if secondary.hash == Some(slate.hash()) {
            slate.mark_uploaded();
            return if !secondary.pending {
                match mode {
                    UpgradeMode::TestOnly | UpgradeMode::TestAndConfirm => {
                        Ok(ValidationPlan::Test { slate: index })
                    }
                    UpgradeMode::ConfirmOnly => Ok(ValidationPlan::Confirm { slate: index }),
                }
            } else if secondary.permanent {
                match mode {
                    UpgradeMode::ConfirmOnly | UpgradeMode::TestAndConfirm => {
                        Ok(ValidationPlan::Reset)
                    }
                    UpgradeMode::TestOnly => Err(FirmwareUpgradeError::AlreadyConfirmedCannotTest),
                }
            } else {
                // pending, but not permanent
                match mode {
                    UpgradeMode::ConfirmOnly => Ok(ValidationPlan::Confirm { slate: index }),
                    UpgradeMode::TestOnly | UpgradeMode::TestAndConfirm => {
                        Ok(ValidationPlan::Reset)
                    }
                }
            };
        }

        // a different image sits in the staging slot
        if secondary.confirmed {
            let Some(primary_hash) = primary.and_then(|p| p.hash) else {
                return Err(FirmwareUpgradeError::InvalidResponse(
                    "primary slot hash required to displace a confirmed staged image",
                ));
            };
            return Ok(ValidationPlan::ValidationConfirm { hash: primary_hash });
        }
        if secondary.pending {
            return Ok(ValidationPlan::ResetAndRevalidate);
        }
        // stale leftover; the upload overwrites it
    }

    if slates.iter().all(ImageSlate::uploaded) {
        Ok(ValidationPlan::Complete)
    } else {
        Ok(ValidationPlan::Upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::image::SlotState;
    use std::sync::Arc;

    const H0: [u8; 32] = [0xA0; 32];
    const H1: [u8; 32] = [0xA1; 32];
    const OLD: [u8; 32] = [0x0F; 32];

    fn slate(image: u32, hash: [u8; 32]) -> ImageSlate {
        ImageSlate::new(image, Arc::from([0u8; 4].as_slice()), hash)
    }

    fn entry(image: u32, slot: u32, hash: [u8; 32]) -> SlotState {
        SlotState {
            image,
            slot,
            version: "1.0.0".to_string(),
            hash: Some(hash),
            bootable: true,
            pending: false,
            confirmed: false,
            active: false,
            permanent: false,
        }
    }

    #[test]
    fn already_running_and_confirmed_is_complete() {
        let report = SlotReport::new(vec![SlotState {
            confirmed: true,
            active: true,
            ..entry(0, 0, H0)
        }]);
        let mut slates = vec![slate(0, H0)];

        let plan = plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap();
        assert_eq!(plan, ValidationPlan::Complete);
        assert!(slates[0].confirmed());
    }

    #[test]
    fn running_but_unconfirmed_wants_confirm() {
        let report = SlotReport::new(vec![entry(0, 0, H0)]);
        let mut slates = vec![slate(0, H0)];

        for mode in [UpgradeMode::ConfirmOnly, UpgradeMode::TestAndConfirm] {
            let mut slates = slates.clone();
            let plan = plan(&report, &mut slates, mode).unwrap();
            assert_eq!(plan, ValidationPlan::Confirm { slate: 0 });
            assert!(slates[0].uploaded());
            assert!(!slates[0].confirmed());
        }

        // test-only leaves the running image alone
        let plan = plan(&report, &mut slates, UpgradeMode::TestOnly).unwrap();
        assert_eq!(plan, ValidationPlan::Complete);
    }

    #[test]
    fn staged_idle_image_is_tested_or_confirmed() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            entry(0, 1, H0),
        ]);

        for (mode, expected) in [
            (UpgradeMode::TestOnly, ValidationPlan::Test { slate: 0 }),
            (UpgradeMode::TestAndConfirm, ValidationPlan::Test { slate: 0 }),
            (UpgradeMode::ConfirmOnly, ValidationPlan::Confirm { slate: 0 }),
        ] {
            let mut slates = vec![slate(0, H0)];
            assert_eq!(plan(&report, &mut slates, mode).unwrap(), expected);
            assert!(slates[0].uploaded());
        }
    }

    #[test]
    fn staged_permanent_image_resets_or_fails() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                pending: true,
                permanent: true,
                ..entry(0, 1, H0)
            },
        ]);

        for mode in [UpgradeMode::ConfirmOnly, UpgradeMode::TestAndConfirm] {
            let mut slates = vec![slate(0, H0)];
            assert_eq!(
                plan(&report, &mut slates, mode).unwrap(),
                ValidationPlan::Reset
            );
        }

        let mut slates = vec![slate(0, H0)];
        assert!(matches!(
            plan(&report, &mut slates, UpgradeMode::TestOnly),
            Err(FirmwareUpgradeError::AlreadyConfirmedCannotTest)
        ));
    }

    #[test]
    fn staged_pending_image_resets_or_confirms() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                pending: true,
                ..entry(0, 1, H0)
            },
        ]);

        for mode in [UpgradeMode::TestOnly, UpgradeMode::TestAndConfirm] {
            let mut slates = vec![slate(0, H0)];
            assert_eq!(
                plan(&report, &mut slates, mode).unwrap(),
                ValidationPlan::Reset
            );
        }

        let mut slates = vec![slate(0, H0)];
        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap(),
            ValidationPlan::Confirm { slate: 0 }
        );
    }

    #[test]
    fn foreign_confirmed_staged_image_is_displaced() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                confirmed: true,
                ..entry(0, 1, H1)
            },
        ]);
        let mut slates = vec![slate(0, H0)];

        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap(),
            ValidationPlan::ValidationConfirm { hash: OLD }
        );
    }

    #[test]
    fn foreign_confirmed_staged_image_without_primary_hash_is_invalid() {
        let report = SlotReport::new(vec![
            SlotState {
                hash: None,
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                confirmed: true,
                ..entry(0, 1, H1)
            },
        ]);
        let mut slates = vec![slate(0, H0)];

        assert!(matches!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly),
            Err(FirmwareUpgradeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn foreign_pending_staged_image_forces_revalidation() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                pending: true,
                ..entry(0, 1, H1)
            },
        ]);
        let mut slates = vec![slate(0, H0)];

        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::TestAndConfirm).unwrap(),
            ValidationPlan::ResetAndRevalidate
        );
    }

    #[test]
    fn foreign_idle_staged_image_is_overwritten() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            entry(0, 1, H1),
        ]);
        let mut slates = vec![slate(0, H0)];

        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap(),
            ValidationPlan::Upload
        );
        assert!(!slates[0].uploaded());
    }

    #[test]
    fn absent_images_lead_to_upload() {
        let report = SlotReport::new(vec![
            SlotState {
                confirmed: true,
                ..entry(0, 0, OLD)
            },
            SlotState {
                confirmed: true,
                ..entry(1, 0, OLD)
            },
        ]);
        let mut slates = vec![slate(0, H0), slate(1, H1)];

        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap(),
            ValidationPlan::Upload
        );
    }

    #[test]
    fn multi_image_scan_stops_at_first_action() {
        // image 0 needs a confirm, image 1 would need an upload; the
        // confirm wins because it comes first in upload order
        let report = SlotReport::new(vec![
            entry(0, 0, H0),
            SlotState {
                confirmed: true,
                ..entry(1, 0, OLD)
            },
        ]);
        let mut slates = vec![slate(0, H0), slate(1, H1)];

        assert_eq!(
            plan(&report, &mut slates, UpgradeMode::ConfirmOnly).unwrap(),
            ValidationPlan::Confirm { slate: 0 }
        );
    }
}
