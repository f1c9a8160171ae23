use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::commands::image::{
    GetImageState, ImageUpload, ImageUploadResponse, SetImageState, SlotState,
    upload_chunk_capacity,
};
use crate::connection::{Connection, ExecuteError, PendingResponse};
use crate::transport::SMP_TRANSFER_BUFFER_SIZE;
use crate::upgrade::{ImageClient, UploadImage, UploadOutcome, UploadSettings};

use super::{SharedConnection, lock_connection};

/// Transfer MTU used until [`ImageClient::set_mtu`] is called.
pub(crate) const DEFAULT_MTU: u32 = 512;

const MTU_RANGE: RangeInclusive<u32> = 23..=1024;

/// Blocking client for the image management group.
///
/// Owns the byte-level upload engine: chunking, MTU and reassembly-buffer
/// sizing, pipelining, and the pause/cancel handling of running uploads.
pub struct ImageManager {
    connection: SharedConnection,
    mtu: AtomicU32,
    control: UploadControl,
}

/// Flags observed by the upload pump at every chunk boundary.
struct UploadControl {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl UploadControl {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn block_while_paused(&self) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !self.cancelled() {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

enum ImageStep {
    Done,
    Cancelled,
}

impl ImageManager {
    /// Creates a manager on a shared connection.
    pub fn new(connection: SharedConnection) -> Self {
        Self {
            connection,
            mtu: AtomicU32::new(DEFAULT_MTU),
            control: UploadControl::new(),
        }
    }

    /// The SMP frame budget for one upload chunk.
    ///
    /// A negotiated reassembly buffer allows frames beyond the link MTU,
    /// the transport reassembles them on the device.
    fn frame_budget(&self, settings: &UploadSettings) -> usize {
        if settings.reassembly_buffer_size > 0 {
            settings
                .reassembly_buffer_size
                .min(SMP_TRANSFER_BUFFER_SIZE as u64) as usize
        } else {
            self.mtu.load(Ordering::SeqCst) as usize
        }
    }

    fn upload_image(
        &self,
        connection: &mut Connection,
        image: &UploadImage,
        settings: &UploadSettings,
        notify: &mut dyn FnMut(u64),
    ) -> Result<ImageStep, ExecuteError> {
        let total = image.data.len() as u64;
        let session_sha: [u8; 32] = Sha256::digest(&image.data).into();

        let chunk_capacity = upload_chunk_capacity(self.frame_budget(settings))
            .map_err(|_| ExecuteError::EncodeFailed)? as u64;
        let depth = settings.pipeline_depth.max(1) as usize;

        let mut inflight: VecDeque<(PendingResponse<ImageUploadResponse>, u64)> = VecDeque::new();
        let mut next_off: u64 = 0;
        let mut acked: u64 = 0;

        while acked < total {
            while inflight.len() < depth && next_off < total {
                self.control.block_while_paused();
                if self.control.cancelled() {
                    self.drain(connection, &mut inflight);
                    return Ok(ImageStep::Cancelled);
                }

                let end = self.chunk_end(next_off, total, chunk_capacity, settings, depth);
                let request = ImageUpload {
                    image: (next_off == 0 && image.image != 0).then_some(image.image),
                    len: (next_off == 0).then_some(total),
                    off: next_off,
                    sha: (next_off == 0).then_some(&session_sha),
                    data: &image.data[next_off as usize..end as usize],
                    upgrade: None,
                };
                let pending = connection.send_request(&request)?;
                inflight.push_back((pending, end));
                next_off = end;
            }

            let Some((pending, expected_off)) = inflight.pop_front() else {
                break;
            };
            let response = connection.receive_response(&pending)?;
            acked = response.off;
            notify(acked.min(total));

            if response.off != expected_off {
                // the device lost a chunk; flush the window and pick the
                // transfer up from the offset it reports
                log::debug!(
                    "upload offset resync: expected {expected_off}, device wants {}",
                    response.off
                );
                for (pending, _) in inflight.drain(..) {
                    let response = connection.receive_response(&pending)?;
                    acked = response.off;
                }
                next_off = acked;
            }
        }

        Ok(ImageStep::Done)
    }

    /// The end offset of the chunk starting at `off`.
    fn chunk_end(
        &self,
        off: u64,
        total: u64,
        chunk_capacity: u64,
        settings: &UploadSettings,
        depth: usize,
    ) -> u64 {
        let mut end = (off + chunk_capacity).min(total);
        if depth > 1 && end < total {
            if let Some(alignment) = settings.byte_alignment.bytes() {
                let aligned = end - (end % alignment);
                if aligned > off {
                    end = aligned;
                }
            }
        }
        end
    }

    /// Receives and discards all in-flight responses, keeping the
    /// connection's request/response pairing intact.
    fn drain(
        &self,
        connection: &mut Connection,
        inflight: &mut VecDeque<(PendingResponse<ImageUploadResponse>, u64)>,
    ) {
        for (pending, _) in inflight.drain(..) {
            if let Err(err) = connection.receive_response(&pending) {
                log::debug!("discarding upload response after cancel failed: {err}");
            }
        }
    }
}

impl ImageClient for ImageManager {
    fn list(&self) -> Result<Vec<SlotState>, ExecuteError> {
        lock_connection(&self.connection)
            .execute_command(&GetImageState)
            .map(|response| response.images)
    }

    fn upload(
        &self,
        images: &[UploadImage],
        settings: &UploadSettings,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<UploadOutcome, ExecuteError> {
        self.control.reset();

        let grand_total: u64 = images.iter().map(|image| image.data.len() as u64).sum();
        let mut base: u64 = 0;

        let mut connection = lock_connection(&self.connection);
        for image in images {
            log::info!(
                "uploading image {} ({} bytes)",
                image.image,
                image.data.len()
            );
            let step = self.upload_image(&mut connection, image, settings, &mut |sent| {
                progress(base + sent, grand_total)
            })?;
            match step {
                ImageStep::Done => base += image.data.len() as u64,
                ImageStep::Cancelled => return Ok(UploadOutcome::Cancelled),
            }
        }

        Ok(UploadOutcome::Completed)
    }

    fn cancel_upload(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.control.resumed.notify_all();
    }

    fn pause_upload(&self) {
        *self
            .control
            .paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn continue_upload(&self) {
        *self
            .control
            .paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.control.resumed.notify_all();
    }

    fn test(&self, hash: &[u8; 32]) -> Result<Vec<SlotState>, ExecuteError> {
        lock_connection(&self.connection)
            .execute_command(&SetImageState {
                hash: Some(hash),
                confirm: false,
            })
            .map(|response| response.images)
    }

    fn confirm(&self, hash: Option<&[u8; 32]>) -> Result<Vec<SlotState>, ExecuteError> {
        lock_connection(&self.connection)
            .execute_command(&SetImageState {
                hash,
                confirm: true,
            })
            .map(|response| response.images)
    }

    fn set_mtu(&self, mtu: u32) -> bool {
        if !MTU_RANGE.contains(&mtu) {
            return false;
        }
        self.mtu.store(mtu, Ordering::SeqCst);
        true
    }
}
