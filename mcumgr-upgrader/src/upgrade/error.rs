use miette::Diagnostic;
use thiserror::Error;

use crate::{connection::ExecuteError, mcuboot::ImageParseError};

/// Possible error values of a firmware upgrade.
///
/// Every error is fatal to the upgrade it occurs in; there are no retries.
#[derive(Error, Debug, Diagnostic)]
pub enum FirmwareUpgradeError {
    /// `start` was called while an upgrade was running.
    #[error("an upgrade is already in progress")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::already_running))]
    AlreadyRunning,
    /// A firmware blob could not be parsed.
    #[error("firmware is not a valid MCUboot image")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::invalid_image))]
    InvalidImage(#[from] ImageParseError),
    /// A response was structurally valid but missing required data.
    #[error("invalid device response: {0}")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::invalid_response))]
    InvalidResponse(&'static str),
    /// A management command failed, on transport level or with a device
    /// reported error code.
    #[error("command execution failed")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::command))]
    Command(#[from] ExecuteError),
    /// The device did not come back after the post-reset swap window.
    #[error("failed to reconnect after device reset")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::reconnect))]
    ConnectionFailedAfterReset(#[source] std::io::Error),
    /// The staged image is already permanent, so a test boot is impossible.
    #[error("staged image is already confirmed and can no longer be tested")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::already_confirmed))]
    AlreadyConfirmedCannotTest,
    /// The device did not mark a tested image as pending.
    #[error("image was tested but the device does not report it as pending")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::not_pending))]
    NotPending,
    /// The device did not mark a confirmed image as permanent.
    #[error("image was confirmed but the device does not report it as permanent")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::not_permanent))]
    NotPermanent,
    /// The device rebooted into a different image than the one under test.
    #[error("device booted a different image than the one being upgraded to")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::boot_failed))]
    BootFailed,
    /// The device booted the new image but did not confirm it.
    #[error("device booted the new image but does not report it as confirmed")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::not_confirmed))]
    NotConfirmed,
    /// The image list does not contain slots for the images of this
    /// upgrade.
    #[error("image list does not cover the images of this upgrade")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::slot_count))]
    SlotCountMismatch,
    /// The upgrade task could not be spawned.
    #[error("failed to spawn the upgrade task")]
    #[diagnostic(code(mcumgr_upgrader::upgrade::spawn))]
    Spawn(#[source] std::io::Error),
}
