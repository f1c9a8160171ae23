//! The firmware upgrade orchestrator.
//!
//! [`FirmwareUpgrader`] drives a complete DFU transaction: parameter
//! negotiation, validation of the device's slot inventory, image upload,
//! test/confirm marking, reboot, reconnect after the MCUboot swap, and the
//! final verification. It talks to the device exclusively through the
//! [`ImageClient`], [`DefaultClient`], [`BasicClient`] and
//! [`TransportGateway`] seams and reports its lifecycle through an
//! [`UpgradeEvent`] channel.

mod clients;
mod error;
mod events;
mod gateway;
mod planner;
mod slate;


pub use clients::{
    BasicClient, ByteAlignment, DefaultClient, ImageClient, SlotReport, UploadImage,
    UploadOutcome, UploadSettings,
};
pub use error::FirmwareUpgradeError;
pub use events::UpgradeEvent;
pub use gateway::{
    ConnectOutcome, ConnectionObserver, ConnectionState, ObserverId, TransportGateway,
};
pub use planner::{ValidationPlan, plan};
pub use slate::ImageSlate;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::mcuboot;

use events::EventSink;

/// How far an upgrade takes a freshly uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeMode {
    /// Mark the image for a single test boot and stop after the reboot.
    /// The device reverts to the old image on the next reset.
    TestOnly,
    /// Make the image permanent before rebooting into it.
    #[default]
    ConfirmOnly,
    /// Test boot the image first, then confirm it once it runs.
    TestAndConfirm,
}

/// Position of the upgrade task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeState {
    /// No upgrade is running.
    #[default]
    Idle,
    /// Negotiating transfer parameters with the device.
    RequestParameters,
    /// Comparing the device's slot inventory against the upgrade's images.
    Validate,
    /// Transferring image data.
    Upload,
    /// Marking images for a test boot.
    Test,
    /// Rebooting the device and waiting for it to come back.
    Reset,
    /// Confirming images.
    Confirm,
    /// The upgrade finished.
    Success,
}

impl UpgradeState {
    /// Whether an upgrade is underway in this state.
    pub fn is_in_progress(self) -> bool {
        self != UpgradeState::Idle
    }
}

/// Input parameters of one upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeConfiguration {
    /// Erase the application settings partition after the upload, before
    /// testing or confirming.
    pub erase_app_settings: bool,
    /// Number of unacknowledged upload chunks kept in flight.
    pub pipeline_depth: u32,
    /// Chunk boundary alignment when pipelining.
    pub byte_alignment: ByteAlignment,
    /// Per-request payload cap. Overwritten by parameter negotiation; 0
    /// sizes chunks from the MTU alone.
    pub reassembly_buffer_size: u64,
}

impl Default for UpgradeConfiguration {
    fn default() -> Self {
        Self {
            erase_app_settings: true,
            pipeline_depth: 1,
            byte_alignment: ByteAlignment::Disabled,
            reassembly_buffer_size: 0,
        }
    }
}

/// One firmware image to be installed, tagged with its image (core) number.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// target image number; 0 is the application core
    pub image: u32,
    /// the MCUboot image blob
    pub data: Vec<u8>,
}

const UPLOAD_MTU_RANGE: std::ops::RangeInclusive<u32> = 23..=1024;

/// Client-side state machine driving a firmware upgrade against one device.
///
/// A call to [`start`](Self::start) spawns a worker that owns the upgrade
/// until a terminal event (`Completed`, `Failed` or `Cancelled`) is posted;
/// the worker's reference keeps the shared state alive even when the
/// `FirmwareUpgrader` handle is dropped mid-flight. All control methods are
/// safe to call from any thread.
pub struct FirmwareUpgrader {
    inner: Arc<Inner>,
}

struct Inner {
    gateway: Arc<dyn TransportGateway>,
    image: Arc<dyn ImageClient>,
    default: Arc<dyn DefaultClient>,
    basic: Arc<dyn BasicClient>,
    events: EventSink,
    shared: Mutex<Shared>,
    resumed: Condvar,
}

struct Shared {
    state: UpgradeState,
    paused: bool,
    mode: UpgradeMode,
    swap_time: Duration,
    slates: Vec<ImageSlate>,
    config: UpgradeConfiguration,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: UpgradeState::Idle,
            paused: false,
            mode: UpgradeMode::default(),
            swap_time: Duration::ZERO,
            slates: Vec::new(),
            config: UpgradeConfiguration::default(),
        }
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FirmwareUpgrader {
    /// Creates an upgrader over the given collaborator seams.
    ///
    /// Lifecycle events are posted into `events`; the caller owns the
    /// receiving side and with it the thread the events are consumed on.
    pub fn new(
        gateway: Arc<dyn TransportGateway>,
        image: Arc<dyn ImageClient>,
        default: Arc<dyn DefaultClient>,
        basic: Arc<dyn BasicClient>,
        events: mpsc::Sender<UpgradeEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                image,
                default,
                basic,
                events: EventSink::new(events),
                shared: Mutex::new(Shared::default()),
                resumed: Condvar::new(),
            }),
        }
    }

    /// Sets the upgrade mode for the next [`start`](Self::start).
    pub fn set_mode(&self, mode: UpgradeMode) {
        self.inner.shared().mode = mode;
    }

    /// Sets how long the device needs for its post-reset image swap. The
    /// reconnect after a reboot is delayed by the remainder of this window.
    pub fn set_estimated_swap_time(&self, swap_time: Duration) {
        self.inner.shared().swap_time = swap_time;
    }

    /// The current position of the upgrade task.
    pub fn state(&self) -> UpgradeState {
        self.inner.shared().state
    }

    /// Whether an upgrade is currently running.
    pub fn is_in_progress(&self) -> bool {
        self.state().is_in_progress()
    }

    /// Whether the upgrade is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.shared().paused
    }

    /// Sets the upload MTU. Returns true iff the value was accepted.
    pub fn set_upload_mtu(&self, mtu: u32) -> bool {
        if !UPLOAD_MTU_RANGE.contains(&mtu) {
            return false;
        }
        self.inner.image.set_mtu(mtu)
    }

    /// Begins an upgrade with the given images.
    ///
    /// Fails with [`FirmwareUpgradeError::AlreadyRunning`] while another
    /// upgrade is in progress and with
    /// [`FirmwareUpgradeError::InvalidImage`] if a blob cannot be parsed.
    /// On success the upgrade continues asynchronously; completion is
    /// reported through the event channel.
    pub fn start(
        &self,
        images: Vec<FirmwareImage>,
        configuration: UpgradeConfiguration,
    ) -> Result<(), FirmwareUpgradeError> {
        let mut slates = Vec::with_capacity(images.len());
        for firmware in images {
            let info = mcuboot::image_info(&firmware.data)?;
            log::debug!(
                "image {}: version {}, {} bytes, hash {}",
                firmware.image,
                info.version,
                firmware.data.len(),
                hex::encode(info.hash)
            );
            slates.push(ImageSlate::new(firmware.image, firmware.data.into(), info.hash));
        }
        slates.sort_by_key(ImageSlate::sort_key);
        let before = slates.len();
        slates.dedup_by_key(|slate| slate.sort_key());
        if slates.len() != before {
            log::warn!("ignoring {} duplicate image(s)", before - slates.len());
        }

        let (mode, swap_time) = {
            let mut shared = self.inner.shared();
            if shared.state != UpgradeState::Idle {
                return Err(FirmwareUpgradeError::AlreadyRunning);
            }
            shared.state = UpgradeState::RequestParameters;
            shared.paused = false;
            shared.slates = slates;
            shared.config = configuration;
            (shared.mode, shared.swap_time)
        };

        self.inner.events.post(UpgradeEvent::Started);
        self.inner.events.post(UpgradeEvent::StateChanged {
            from: UpgradeState::Idle,
            to: UpgradeState::RequestParameters,
        });

        let worker = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("mcumgr-upgrade".to_string())
            .spawn(move || run_upgrade(worker, mode, swap_time));

        if let Err(err) = spawned {
            let mut shared = self.inner.shared();
            shared.state = UpgradeState::Idle;
            shared.slates.clear();
            drop(shared);
            self.inner.events.post(UpgradeEvent::Failed {
                state: UpgradeState::RequestParameters,
                error: FirmwareUpgradeError::Spawn(std::io::Error::new(
                    err.kind(),
                    err.to_string(),
                )),
            });
            return Err(FirmwareUpgradeError::Spawn(err));
        }
        Ok(())
    }

    /// Aborts a running upload.
    ///
    /// Only effective while the upgrade is in the upload phase; once an
    /// image is fully transferred, backing out would leave the device in a
    /// worse state than finishing, so later cancels are ignored.
    pub fn cancel(&self) {
        let uploading = self.inner.shared().state == UpgradeState::Upload;
        if uploading {
            self.inner.image.cancel_upload();
        } else {
            log::debug!("cancel ignored outside of the upload phase");
        }
    }

    /// Pauses the upgrade at the next command boundary.
    pub fn pause(&self) {
        let uploading = {
            let mut shared = self.inner.shared();
            shared.paused = true;
            shared.state == UpgradeState::Upload
        };
        if uploading {
            self.inner.image.pause_upload();
        }
        log::debug!("upgrade paused");
    }

    /// Resumes a paused upgrade where it stopped.
    pub fn resume(&self) {
        let uploading = {
            let mut shared = self.inner.shared();
            shared.paused = false;
            shared.state == UpgradeState::Upload
        };
        self.inner.resumed.notify_all();
        if uploading {
            self.inner.image.continue_upload();
        }
        log::debug!("upgrade resumed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Succeeded,
    Cancelled,
}

enum Flow {
    Negotiate,
    Validate,
    Upload,
    Test {
        slate: usize,
    },
    Confirm {
        hash: Option<[u8; 32]>,
        /// hash of the slate this confirm is already the retry for
        retried: Option<[u8; 32]>,
    },
    Reset,
    Done(RunOutcome),
}

fn run_upgrade(inner: Arc<Inner>, mode: UpgradeMode, swap_time: Duration) {
    let driver = Driver {
        inner: &inner,
        mode,
        swap_time,
    };

    match driver.drive() {
        Ok(RunOutcome::Succeeded) => {
            driver.set_state(UpgradeState::Success);
            inner.events.post(UpgradeEvent::Completed);
            driver.clear();
        }
        Ok(RunOutcome::Cancelled) => {
            driver.clear();
            inner.events.post(UpgradeEvent::Cancelled {
                state: UpgradeState::Idle,
            });
        }
        Err(error) => {
            let failure_state = {
                let mut shared = inner.shared();
                let state = shared.state;
                shared.state = UpgradeState::Idle;
                shared.paused = false;
                shared.slates.clear();
                state
            };
            log::warn!("upgrade failed in state {failure_state:?}: {error}");
            inner.events.post(UpgradeEvent::Failed {
                state: failure_state,
                error,
            });
        }
    }
    // dropping `inner` here releases the worker's keep-alive reference;
    // this is the single release point for every terminal outcome
}

struct Driver<'a> {
    inner: &'a Inner,
    mode: UpgradeMode,
    swap_time: Duration,
}

impl Driver<'_> {
    fn drive(&self) -> Result<RunOutcome, FirmwareUpgradeError> {
        let mut flow = Flow::Negotiate;
        loop {
            flow = match flow {
                Flow::Negotiate => self.negotiate()?,
                Flow::Validate => self.validate()?,
                Flow::Upload => self.upload()?,
                Flow::Test { slate } => self.test(slate)?,
                Flow::Confirm { hash, retried } => self.confirm(hash, retried)?,
                Flow::Reset => self.reset_and_reconnect()?,
                Flow::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// Blocks while the upgrade is paused. Sits before every command
    /// issuance; responses that are already in flight are still handled.
    fn pause_point(&self) {
        let mut shared = self.inner.shared();
        while shared.paused {
            shared = self
                .inner
                .resumed
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set_state(&self, to: UpgradeState) {
        let from = {
            let mut shared = self.inner.shared();
            if shared.state == to {
                return;
            }
            let from = shared.state;
            shared.state = to;
            from
        };
        log::debug!("state transition: {from:?} -> {to:?}");
        self.inner
            .events
            .post(UpgradeEvent::StateChanged { from, to });
    }

    fn clear(&self) {
        let mut shared = self.inner.shared();
        shared.state = UpgradeState::Idle;
        shared.paused = false;
        shared.slates.clear();
    }

    /// Queries the device's SMP buffer parameters.
    ///
    /// This is the one command whose failure is absorbed: firmware
    /// predating the command answers `MGMT_ERR_ENOTSUP`, and upgrades
    /// must keep working against it.
    fn negotiate(&self) -> Result<Flow, FirmwareUpgradeError> {
        self.pause_point();
        let negotiated = match self.inner.default.params() {
            Ok(params) => {
                log::debug!(
                    "device reports {} SMP buffers of {} bytes",
                    params.buf_count,
                    params.buf_size
                );
                u64::from(params.buf_size)
            }
            Err(err) => {
                if err.device_rc() == Some(8) {
                    log::info!(
                        "device does not know the parameters command, assuming old firmware"
                    );
                } else {
                    log::warn!("parameter negotiation failed, continuing without: {err}");
                }
                0
            }
        };
        self.inner.shared().config.reassembly_buffer_size = negotiated;

        self.set_state(UpgradeState::Validate);
        Ok(Flow::Validate)
    }

    fn validate(&self) -> Result<Flow, FirmwareUpgradeError> {
        self.pause_point();
        let report = SlotReport::new(self.inner.image.list()?);
        if report.is_empty() {
            return Err(FirmwareUpgradeError::InvalidResponse(
                "image list reports no slots",
            ));
        }

        let decision = {
            let mut shared = self.inner.shared();
            planner::plan(&report, &mut shared.slates, self.mode)?
        };
        log::debug!("validation decision: {decision:?}");

        match decision {
            ValidationPlan::Complete => Ok(Flow::Done(RunOutcome::Succeeded)),
            ValidationPlan::Upload => {
                self.set_state(UpgradeState::Upload);
                Ok(Flow::Upload)
            }
            ValidationPlan::Test { slate } => {
                self.set_state(UpgradeState::Test);
                Ok(Flow::Test { slate })
            }
            ValidationPlan::Confirm { slate } => {
                let hash = self.inner.shared().slates[slate].hash();
                self.set_state(UpgradeState::Confirm);
                Ok(Flow::Confirm {
                    hash: Some(hash),
                    retried: None,
                })
            }
            ValidationPlan::ValidationConfirm { hash } => {
                self.pause_point();
                self.inner.image.confirm(Some(&hash))?;
                log::debug!(
                    "re-confirmed primary {} to release the staging slot, validating again",
                    hex::encode(hash)
                );
                Ok(Flow::Validate)
            }
            ValidationPlan::Reset => {
                self.set_state(UpgradeState::Reset);
                Ok(Flow::Reset)
            }
            // the state stays Validate, so the post-reset dispatch lands
            // back here for another look at the inventory
            ValidationPlan::ResetAndRevalidate => Ok(Flow::Reset),
        }
    }

    fn upload(&self) -> Result<Flow, FirmwareUpgradeError> {
        self.pause_point();
        let (targets, settings) = {
            let shared = self.inner.shared();
            let targets: Vec<UploadImage> = shared
                .slates
                .iter()
                .filter(|slate| !slate.uploaded())
                .map(|slate| UploadImage {
                    image: slate.image(),
                    data: slate.data().clone(),
                })
                .collect();
            let settings = UploadSettings {
                pipeline_depth: shared.config.pipeline_depth.max(1),
                byte_alignment: shared.config.byte_alignment,
                reassembly_buffer_size: shared.config.reassembly_buffer_size,
            };
            (targets, settings)
        };

        let events = &self.inner.events;
        let outcome = self.inner.image.upload(
            &targets,
            &settings,
            &mut |bytes_sent, image_size| {
                events.post(UpgradeEvent::Progress {
                    bytes_sent,
                    image_size,
                    timestamp: Utc::now(),
                });
            },
        )?;

        match outcome {
            UploadOutcome::Cancelled => Ok(Flow::Done(RunOutcome::Cancelled)),
            UploadOutcome::Completed => {
                let mut shared = self.inner.shared();
                for slate in shared.slates.iter_mut() {
                    slate.mark_uploaded();
                }
                drop(shared);
                self.upload_finished()
            }
        }
    }

    fn upload_finished(&self) -> Result<Flow, FirmwareUpgradeError> {
        while self.inner.shared().config.erase_app_settings {
            self.pause_point();
            match self.inner.basic.erase_app_settings() {
                Ok(()) => log::debug!("app settings erased"),
                Err(err) if err.device_rc().is_some_and(|rc| rc != 0) => {
                    // devices without a settings partition answer with an
                    // error code; for the upgrade that is as good as done
                    log::info!("erase app settings answered {err}, continuing");
                }
                Err(err) => return Err(err.into()),
            }
            self.inner.shared().config.erase_app_settings = false;
        }

        let next = {
            let shared = self.inner.shared();
            match self.mode {
                UpgradeMode::ConfirmOnly => shared
                    .slates
                    .iter()
                    .position(|slate| !slate.confirmed())
                    .map(|index| {
                        (
                            UpgradeState::Confirm,
                            Flow::Confirm {
                                hash: Some(shared.slates[index].hash()),
                                retried: None,
                            },
                        )
                    }),
                UpgradeMode::TestOnly | UpgradeMode::TestAndConfirm => shared
                    .slates
                    .iter()
                    .position(|slate| !slate.tested())
                    .map(|index| (UpgradeState::Test, Flow::Test { slate: index })),
            }
        };

        match next {
            Some((state, flow)) => {
                self.set_state(state);
                Ok(flow)
            }
            None => Ok(Flow::Done(RunOutcome::Succeeded)),
        }
    }

    fn test(&self, slate: usize) -> Result<Flow, FirmwareUpgradeError> {
        enum Scan {
            AllPending,
            Retry(usize),
            NotPending,
        }

        let mut target = slate;
        loop {
            self.pause_point();
            let hash = self.inner.shared().slates[target].hash();
            let report = SlotReport::new(self.inner.image.test(&hash)?);

            let scan = {
                let shared = self.inner.shared();
                let mut scan = Scan::AllPending;
                for (index, slate) in shared.slates.iter().enumerate() {
                    let staged_and_pending = report
                        .slot(slate.image(), 1)
                        .map(|entry| entry.hash == Some(slate.hash()) && entry.pending)
                        .unwrap_or(false);
                    if !staged_and_pending {
                        scan = if slate.tested() {
                            Scan::NotPending
                        } else {
                            Scan::Retry(index)
                        };
                        break;
                    }
                }
                scan
            };

            match scan {
                Scan::AllPending => {
                    let mut shared = self.inner.shared();
                    for slate in shared.slates.iter_mut() {
                        slate.mark_tested();
                    }
                    drop(shared);
                    self.set_state(UpgradeState::Reset);
                    return Ok(Flow::Reset);
                }
                Scan::Retry(index) => target = index,
                Scan::NotPending => return Err(FirmwareUpgradeError::NotPending),
            }
        }
    }

    fn confirm(
        &self,
        hash: Option<[u8; 32]>,
        retried: Option<[u8; 32]>,
    ) -> Result<Flow, FirmwareUpgradeError> {
        self.pause_point();
        let report = SlotReport::new(self.inner.image.confirm(hash.as_ref())?);

        match self.mode {
            UpgradeMode::ConfirmOnly => self.confirm_staged(&report, retried),
            UpgradeMode::TestAndConfirm => self.confirm_booted(&report),
            UpgradeMode::TestOnly => {
                // no confirm command is ever issued in test-only mode
                log::warn!("ignoring confirm response in test-only mode");
                Ok(Flow::Done(RunOutcome::Succeeded))
            }
        }
    }

    /// Confirm handling before the reboot: the new image sits in the
    /// staging slot and must become permanent.
    ///
    /// `retried` names the slate whose confirm was already re-issued once;
    /// a second unchanged answer for it is a device refusal.
    fn confirm_staged(
        &self,
        report: &SlotReport,
        retried: Option<[u8; 32]>,
    ) -> Result<Flow, FirmwareUpgradeError> {
        enum Next {
            ScanDone,
            Reset,
            Reconfirm([u8; 32]),
        }

        let next = {
            let mut shared = self.inner.shared();
            let mut next = Next::ScanDone;
            for index in 0..shared.slates.len() {
                if shared.slates[index].confirmed() {
                    continue;
                }
                let image = shared.slates[index].image();
                match report.slot(image, 1) {
                    None => {
                        // a device that has already swapped reports only
                        // the primary slot
                        if report.slot(image, 0).is_none() {
                            return Err(FirmwareUpgradeError::InvalidResponse(
                                "image is in neither slot after confirm",
                            ));
                        }
                        shared.slates[index].mark_confirmed();
                    }
                    Some(staged) => {
                        if staged.permanent {
                            shared.slates[index].mark_confirmed();
                        } else if staged.pending {
                            // a pending image only becomes permanent
                            // through a reboot
                            next = Next::Reset;
                            break;
                        } else if retried == Some(shared.slates[index].hash()) {
                            // confirming a second time changed nothing
                            return Err(FirmwareUpgradeError::NotPermanent);
                        } else {
                            // the confirm was lost or ignored; it is
                            // idempotent, so send it once more
                            next = Next::Reconfirm(shared.slates[index].hash());
                            break;
                        }
                    }
                }
            }
            next
        };

        match next {
            Next::ScanDone | Next::Reset => {
                self.set_state(UpgradeState::Reset);
                Ok(Flow::Reset)
            }
            Next::Reconfirm(hash) => Ok(Flow::Confirm {
                hash: Some(hash),
                retried: Some(hash),
            }),
        }
    }

    /// Confirm handling after the reboot: the device must now be running
    /// the new image, confirmed.
    fn confirm_booted(&self, report: &SlotReport) -> Result<Flow, FirmwareUpgradeError> {
        let mut shared = self.inner.shared();
        let mut saw_primary = false;
        for index in 0..shared.slates.len() {
            let image = shared.slates[index].image();
            let hash = shared.slates[index].hash();
            if let Some(primary) = report.slot(image, 0) {
                saw_primary = true;
                if primary.hash != Some(hash) {
                    return Err(FirmwareUpgradeError::BootFailed);
                }
                if !primary.confirmed {
                    return Err(FirmwareUpgradeError::NotConfirmed);
                }
                shared.slates[index].mark_confirmed();
            }
        }
        if !saw_primary {
            return Err(FirmwareUpgradeError::SlotCountMismatch);
        }
        Ok(Flow::Done(RunOutcome::Succeeded))
    }

    /// Reboots the device, waits out the swap window, reconnects, and
    /// dispatches by the state the upgrade was in when the reset was
    /// decided.
    fn reset_and_reconnect(&self) -> Result<Flow, FirmwareUpgradeError> {
        self.pause_point();

        let (observer_tx, observer_rx) = mpsc::channel();
        let observer = ObserverGuard {
            gateway: self.inner.gateway.as_ref(),
            id: self.inner.gateway.add_observer(Box::new(move |state| {
                let _ = observer_tx.send(state);
            })),
        };

        self.inner.default.reset()?;
        let reset_response_time = Instant::now();
        log::debug!("reset acknowledged, waiting for the disconnect");

        loop {
            match observer_rx.recv() {
                Ok(ConnectionState::Disconnected) => break,
                Ok(_) => continue,
                Err(_) => return Err(observer_lost()),
            }
        }

        // wait out the remainder of the swap window before knocking again
        let remaining = self.swap_time.saturating_sub(reset_response_time.elapsed());
        if !remaining.is_zero() {
            log::debug!("waiting {remaining:?} for the image swap");
            std::thread::sleep(remaining);
        }

        match self.inner.gateway.connect() {
            ConnectOutcome::Connected => log::debug!("reconnected"),
            ConnectOutcome::Deferred => {
                log::debug!("transport reconnects on its own, waiting");
                loop {
                    match observer_rx.recv() {
                        Ok(ConnectionState::Connected) => break,
                        Ok(_) => continue,
                        Err(_) => return Err(observer_lost()),
                    }
                }
            }
            ConnectOutcome::Failed(err) => {
                return Err(FirmwareUpgradeError::ConnectionFailedAfterReset(err));
            }
        }
        drop(observer);

        let state = self.inner.shared().state;
        match state {
            UpgradeState::RequestParameters => Ok(Flow::Negotiate),
            UpgradeState::Validate => Ok(Flow::Validate),
            UpgradeState::Reset => match self.mode {
                UpgradeMode::TestAndConfirm => {
                    // verify that the device actually booted and kept the
                    // new image: an unqualified confirm acts on the
                    // primary slot and reports the inventory back
                    self.set_state(UpgradeState::Confirm);
                    Ok(Flow::Confirm {
                        hash: None,
                        retried: None,
                    })
                }
                UpgradeMode::TestOnly | UpgradeMode::ConfirmOnly => {
                    Ok(Flow::Done(RunOutcome::Succeeded))
                }
            },
            other => {
                log::warn!("unexpected state {other:?} after reconnect, validating again");
                Ok(Flow::Validate)
            }
        }
    }
}

struct ObserverGuard<'a> {
    gateway: &'a dyn TransportGateway,
    id: ObserverId,
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.gateway.remove_observer(self.id);
    }
}

fn observer_lost() -> FirmwareUpgradeError {
    FirmwareUpgradeError::ConnectionFailedAfterReset(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "transport observer channel closed",
    ))
}
