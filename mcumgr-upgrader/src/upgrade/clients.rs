use std::sync::Arc;

use crate::{commands::image::SlotState, connection::ExecuteError};

/// The device's image inventory, as answered to a state or upload related
/// command.
#[derive(Debug, Clone)]
pub struct SlotReport {
    entries: Vec<SlotState>,
}

impl SlotReport {
    /// Wraps the slot records of an image-state response.
    pub fn new(entries: Vec<SlotState>) -> Self {
        Self { entries }
    }

    /// Whether the report contains no slots at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The record for the given image and slot number, if reported.
    pub fn slot(&self, image: u32, slot: u32) -> Option<&SlotState> {
        self.entries
            .iter()
            .find(|entry| entry.image == image && entry.slot == slot)
    }

    /// All records of the report.
    pub fn entries(&self) -> &[SlotState] {
        &self.entries
    }
}

/// One firmware image handed to the upload engine.
#[derive(Debug, Clone)]
pub struct UploadImage {
    /// target image (core) number
    pub image: u32,
    /// the firmware blob
    pub data: Arc<[u8]>,
}

/// Chunk boundary alignment used while pipelining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteAlignment {
    /// No alignment constraint.
    #[default]
    Disabled,
    /// Chunks end on 2-byte boundaries.
    Two,
    /// Chunks end on 4-byte boundaries.
    Four,
    /// Chunks end on 8-byte boundaries.
    Eight,
    /// Chunks end on 16-byte boundaries.
    Sixteen,
}

impl ByteAlignment {
    /// The alignment in bytes, or `None` when disabled.
    pub fn bytes(self) -> Option<u64> {
        match self {
            ByteAlignment::Disabled => None,
            ByteAlignment::Two => Some(2),
            ByteAlignment::Four => Some(4),
            ByteAlignment::Eight => Some(8),
            ByteAlignment::Sixteen => Some(16),
        }
    }
}

/// Transfer parameters for one upload run.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// number of unacknowledged chunks kept in flight
    pub pipeline_depth: u32,
    /// chunk boundary alignment when pipelining
    pub byte_alignment: ByteAlignment,
    /// negotiated per-request payload cap; 0 disables the cap and chunks
    /// are sized from the MTU alone
    pub reassembly_buffer_size: u64,
}

/// How an upload run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// All images were transferred.
    Completed,
    /// The upload was cancelled before completion.
    Cancelled,
}

/// The image management command group, as consumed by the orchestrator.
pub trait ImageClient: Send + Sync {
    /// Reads the device's image inventory.
    fn list(&self) -> Result<Vec<SlotState>, ExecuteError>;

    /// Uploads the given images in order, blocking until the transfer
    /// finishes or is cancelled. `progress` receives
    /// `(bytes_acknowledged, total_bytes)` aggregated over all images.
    fn upload(
        &self,
        images: &[UploadImage],
        settings: &UploadSettings,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<UploadOutcome, ExecuteError>;

    /// Aborts a running upload at the next chunk boundary.
    fn cancel_upload(&self);

    /// Holds a running upload at the next chunk boundary.
    fn pause_upload(&self);

    /// Releases a previously paused upload.
    fn continue_upload(&self);

    /// Marks the image with the given hash for a test boot.
    fn test(&self, hash: &[u8; 32]) -> Result<Vec<SlotState>, ExecuteError>;

    /// Confirms the image with the given hash, or the currently running
    /// image when no hash is given.
    fn confirm(&self, hash: Option<&[u8; 32]>) -> Result<Vec<SlotState>, ExecuteError>;

    /// Sets the transfer MTU. Returns false if the value is rejected.
    fn set_mtu(&self, mtu: u32) -> bool;
}

/// The default/OS management command group, as consumed by the
/// orchestrator.
pub trait DefaultClient: Send + Sync {
    /// Queries the device's SMP buffer parameters.
    fn params(&self) -> Result<crate::commands::os::McuMgrParametersResponse, ExecuteError>;

    /// Reboots the device.
    fn reset(&self) -> Result<(), ExecuteError>;
}

/// The Zephyr basic command group, as consumed by the orchestrator.
pub trait BasicClient: Send + Sync {
    /// Erases the application settings partition.
    fn erase_app_settings(&self) -> Result<(), ExecuteError>;
}
