use std::sync::mpsc;

use chrono::{DateTime, Utc};

use super::{FirmwareUpgradeError, UpgradeState};

/// Lifecycle events of a firmware upgrade.
///
/// Events are posted into the channel handed to
/// [`FirmwareUpgrader::new`](super::FirmwareUpgrader::new) and are totally
/// ordered per upgrade: `Started` first, then any number of `StateChanged`
/// and `Progress` events, then exactly one of `Completed`, `Failed` or
/// `Cancelled`.
#[derive(Debug)]
pub enum UpgradeEvent {
    /// The upgrade was accepted and is running.
    Started,
    /// The upgrade moved to a new state.
    StateChanged {
        /// the state the upgrade was in
        from: UpgradeState,
        /// the state the upgrade is in now
        to: UpgradeState,
    },
    /// Upload progress, aggregated over all images of the upgrade.
    Progress {
        /// bytes acknowledged by the device so far
        bytes_sent: u64,
        /// total bytes of all images
        image_size: u64,
        /// when the progress was observed
        timestamp: DateTime<Utc>,
    },
    /// The upgrade finished successfully.
    Completed,
    /// The upgrade failed and was abandoned.
    Failed {
        /// the state the upgrade failed in
        state: UpgradeState,
        /// what went wrong
        error: FirmwareUpgradeError,
    },
    /// The upload was cancelled by the user.
    Cancelled {
        /// the state after cancellation
        state: UpgradeState,
    },
}

/// Posts events to the channel owned by the caller.
///
/// A dropped receiver is not an error; the upgrade keeps running without an
/// audience.
pub(super) struct EventSink {
    sender: mpsc::Sender<UpgradeEvent>,
}

impl EventSink {
    pub(super) fn new(sender: mpsc::Sender<UpgradeEvent>) -> Self {
        Self { sender }
    }

    pub(super) fn post(&self, event: UpgradeEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("upgrade event dropped, receiver is gone");
        }
    }
}
