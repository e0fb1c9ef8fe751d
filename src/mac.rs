//! The driver context object.
//!
//! [`AdHocMac`] owns every piece of mutable driver state and exposes two
//! families of entry points. The interrupt family
//! ([`handle_response_buffer`](AdHocMac::handle_response_buffer),
//! [`atim_window_started`](AdHocMac::atim_window_started)) is cheap and
//! bounded; the cooperative family (frame draining, deferred work, sleep
//! requests, transmit bookkeeping) may take its time. The two families
//! communicate only through the named flag set, never by calling across.

use core::cell::RefCell;

use embassy_futures::{
    select::{select, Either},
    yield_now,
};
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;
use macro_bits::{bit, check_bit};

use crate::{
    cmd::CommandSequencer,
    fwcmd::CommandRecord,
    fwdesc::Capabilities,
    lock::OperationFlags,
    psm::{PowerSave, PsmError, PsmPhase, PsmState, RfState},
    queue::{EnqueueError, FrameQueue, RxQueueResources},
    rx::{ResponseStream, RxSegment},
    stats::Counters,
    sync::{SignalQueue, WorkFlags},
    DefaultRawMutex,
};

/// Deferred-work bits, set in interrupt context and drained cooperatively.
pub const WORK_REBUILD_ATIMS: u8 = bit!(0);
pub const WORK_CLEAR_ROSTER: u8 = bit!(1);
pub const WORK_FIRST_BEACON: u8 = bit!(2);
pub const WORK_REBUILD_BEACON: u8 = bit!(3);

/// Why the device should be restarted.
///
/// This core only raises the request; tearing the device down and bringing
/// it back up is the owner's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartReason {
    FatalFirmwareError,
    TooManyFirmwareErrors,
    Watchdog,
    /// Command responses were lost, the sequence no longer adds up.
    LostResponse,
}

/// Operating mode of the (single) virtual interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InterfaceMode {
    #[default]
    AdHoc,
    Station,
    AccessPoint,
}

/// Runtime configuration, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacConfig {
    pub mode: InterfaceMode,
    /// Ad-hoc power-save mode requested.
    pub power_save: bool,
    /// Delay between the TBTT trap and the start of the ATIM window.
    ///
    /// Cell dependent; all stations of a cell must agree on it.
    pub atim_window_offset: Duration,
}
impl Default for MacConfig {
    fn default() -> Self {
        Self {
            mode: InterfaceMode::AdHoc,
            power_save: false,
            // One beacon time unit.
            atim_window_offset: Duration::from_micros(1024),
        }
    }
}

/// Notifications this core emits towards its collaborators.
///
/// One implementation is chosen at construction and stays for the lifetime
/// of the driver. All methods default to doing nothing, so integrations
/// only wire up what they care about; [`NullSink`] is that empty set.
pub trait EventSink {
    /// The `(rf, phase)` pair changed. Decides ATIM-vs-immediate queueing
    /// in the transmit scheduler.
    fn psm_state_changed(&self, _state: PsmState) {}
    /// Arm the one-shot ATIM-window timer `offset` after the TBTT that just
    /// fired; report expiry through
    /// [`AdHocMac::atim_window_started`].
    fn arm_atim_timer(&self, _offset: Duration) {}
    fn restart_requested(&self, _reason: RestartReason) {}
    /// A synchronous command response arrived for the waiting issuer.
    fn command_response(&self, _record: &CommandRecord<'_>) {}
    fn firmware_booted(&self) {}
    /// The first beacon went out; the cell is joined or created.
    fn first_beacon_transmitted(&self) {}
    /// Pending data frames need ATIM announcements built for the window
    /// that is about to open.
    fn rebuild_atim_frames(&self) {}
    fn rebuild_beacon(&self) {}
}

/// The do-nothing sink, for bring-up and tests.
pub struct NullSink;
impl EventSink for NullSink {}

/// The ad-hoc MAC control core.
pub struct AdHocMac<'res> {
    capabilities: Capabilities,
    counters: Counters,
    flags: OperationFlags,
    psm: PowerSave,
    sequencer: Mutex<DefaultRawMutex, RefCell<CommandSequencer>>,
    rx_queue: Mutex<DefaultRawMutex, RefCell<FrameQueue<'res>>>,
    rx_signals: SignalQueue,
    work: WorkFlags,
    sink: &'res dyn EventSink,
}
impl<'res> AdHocMac<'res> {
    /// Build the control core around a validated firmware image.
    ///
    /// `BUFFER_SIZE` should be at least the maximum MPDU the firmware can
    /// deliver ([`Capabilities::rx_buffer_size`] bounds it); larger frames
    /// are dropped and counted.
    pub fn new<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize>(
        config: MacConfig,
        capabilities: Capabilities,
        sink: &'res dyn EventSink,
        resources: &'res mut RxQueueResources<BUFFER_SIZE, BUFFER_COUNT>,
    ) -> Self {
        let mut power_save = config.power_save;
        if power_save && !capabilities.power_save {
            warn!("firmware lacks power-save support, staying awake");
            power_save = false;
        }
        if config.mode == InterfaceMode::AdHoc && !capabilities.adhoc_beaconing {
            warn!("firmware beacon buffer unusable for ad-hoc beaconing");
        }
        Self {
            sequencer: Mutex::new(RefCell::new(CommandSequencer::new(
                capabilities.cmd_buffer_count,
                config.mode,
            ))),
            psm: PowerSave::new(power_save, config.atim_window_offset),
            rx_queue: resources.init(),
            rx_signals: SignalQueue::new(),
            work: WorkFlags::new(),
            flags: OperationFlags::new(),
            counters: Counters::new(),
            capabilities,
            sink,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
    pub fn psm_state(&self) -> PsmState {
        self.psm.state()
    }
    pub fn beacon_cycles(&self) -> u32 {
        self.psm.beacon_cycles()
    }

    /// Interrupt entry point: one raw response buffer from the transport.
    ///
    /// Splits the stream, dispatches command records in place and copies
    /// data fragments into the pending-frame queue. Never blocks, never
    /// aborts; everything that cannot be handled is dropped and counted.
    pub fn handle_response_buffer(&self, buffer: &[u8]) {
        for segment in ResponseStream::new(buffer, &self.counters) {
            match segment {
                RxSegment::Data(fragment) => self.queue_frame(fragment),
                RxSegment::Command(record) => {
                    // A gap was already counted and the restart requested;
                    // dispatch simply stops trusting this record.
                    let _ = self.sequencer.lock(|sequencer| {
                        sequencer.borrow_mut().submit(
                            &record,
                            &self.psm,
                            &self.flags,
                            &self.work,
                            &self.counters,
                            self.sink,
                        )
                    });
                }
            }
        }
    }
    fn queue_frame(&self, fragment: &[u8]) {
        let queued = self
            .rx_queue
            .lock(|queue| queue.borrow_mut().enqueue(fragment));
        match queued {
            Ok(()) => self.rx_signals.put(),
            Err(EnqueueError::QueueFull) => {
                debug!("pending-frame queue full, dropping {} bytes", fragment.len());
                Counters::bump(&self.counters.rx_dropped);
            }
            Err(EnqueueError::Oversized) => {
                warn!("oversized frame of {} bytes dropped", fragment.len());
                Counters::bump(&self.counters.rx_dropped);
            }
        }
    }

    /// The ATIM-window timer armed through the sink has fired.
    pub fn atim_window_started(&self) {
        self.psm.atim_window_started(self.sink);
    }
    /// The beacon collaborator opened the software beaconing period.
    pub fn begin_soft_beacon_window(&self) {
        self.psm.begin_soft_beacon_window(self.sink);
    }

    /// Asynchronously receive the next pending frame. Cooperative context.
    pub async fn receive<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let mut f = Some(f);
        loop {
            self.rx_signals.next().await;
            let result = self.rx_queue.lock(|queue| {
                let mut queue = queue.borrow_mut();
                if queue.len() == 0 {
                    None
                } else {
                    queue.dequeue(f.take().unwrap())
                }
            });
            if let Some(result) = result {
                return result;
            }
            trace!("spurious receive signal");
        }
    }
    /// Take one pending frame if there is one. Cooperative context.
    pub fn try_receive<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.rx_queue.lock(|queue| queue.borrow_mut().dequeue(f))
    }
    /// Drain every pending frame, yielding between frames so one busy
    /// interval cannot starve the rest of the cooperative scheduler.
    pub async fn drain_received(&self, mut f: impl FnMut(&[u8])) -> usize {
        let mut drained = 0;
        while self
            .rx_queue
            .lock(|queue| queue.borrow_mut().dequeue(&mut f))
            .is_some()
        {
            drained += 1;
            yield_now().await;
        }
        drained
    }

    /// Wait for deferred work flagged by the interrupt context and run it.
    pub async fn process_deferred(&self) {
        let bits = self.work.wait().await;
        self.dispatch_deferred(bits);
    }
    /// Non-blocking variant of [`process_deferred`](Self::process_deferred).
    pub fn poll_deferred(&self) {
        let bits = self.work.take();
        if bits != 0 {
            self.dispatch_deferred(bits);
        }
    }
    fn dispatch_deferred(&self, bits: u8) {
        if check_bit!(bits, WORK_CLEAR_ROSTER) {
            self.psm.clear_awake_neighbors();
        }
        if check_bit!(bits, WORK_FIRST_BEACON) {
            info!("first beacon transmitted, cell is up");
            self.sink.first_beacon_transmitted();
        }
        if check_bit!(bits, WORK_REBUILD_ATIMS) {
            self.sink.rebuild_atim_frames();
        }
        if check_bit!(bits, WORK_REBUILD_BEACON) {
            self.sink.rebuild_beacon();
        }
    }
    /// Serve deferred work and received frames until cancelled.
    pub async fn run(&self, mut on_frame: impl FnMut(&[u8])) -> ! {
        loop {
            match select(self.work.wait(), self.rx_signals.next()).await {
                Either::First(bits) => self.dispatch_deferred(bits),
                Either::Second(()) => {
                    let _ = self
                        .rx_queue
                        .lock(|queue| queue.borrow_mut().dequeue(&mut on_frame));
                }
            }
            yield_now().await;
        }
    }

    /// Whether a frame may be put on the air right now.
    ///
    /// Requires an awake RF, a window that allows transmissions and a free
    /// bulk pipe.
    pub fn may_transmit(&self) -> bool {
        let state = self.psm.state();
        state.rf == RfState::Wake
            && matches!(state.phase, PsmPhase::TxWindow | PsmPhase::AtimWindow)
            && !self.flags.tx_async_lock.is_busy()
    }
    /// A data frame is being handed to the transport; its TX status will
    /// resolve the wait. Cooperative context.
    pub fn begin_data_transmission(&self) -> bool {
        let fresh = self.flags.tx_data_wait.start();
        if !fresh {
            warn!("data transmission started while one is pending");
        }
        fresh
    }
    /// Same, for an ATIM announcement inside the window.
    pub fn begin_atim_transmission(&self) -> bool {
        let fresh = self.flags.tx_atim_wait.start();
        if !fresh {
            warn!("ATIM transmission started while one is pending");
        }
        fresh
    }
    /// An asynchronous command is going out on the control pipe.
    pub fn begin_async_command(&self) -> bool {
        self.flags.cmd_async_lock.start()
    }
    /// A bulk transfer is going out on the data pipe.
    pub fn begin_bulk_transfer(&self) -> bool {
        self.flags.tx_async_lock.start()
    }

    /// Ask the power-save scheduler to put the RF to sleep; the caller
    /// issues the actual PSM command on success.
    pub fn request_sleep(&self) -> Result<(), PsmError> {
        self.psm.request_sleep(&self.flags)
    }
    pub fn request_wake(&self) -> Result<(), PsmError> {
        self.psm.request_wake()
    }
    /// Recompute the RF state the configuration wants and schedule the
    /// transition; returns the direction the caller should command.
    pub fn update_power_state(&self) -> Option<RfState> {
        self.psm.ps_update(&self.flags)
    }
    pub fn set_power_save(&self, enabled: bool) {
        if enabled && !self.capabilities.power_save {
            warn!("firmware lacks power-save support, staying awake");
            return;
        }
        self.psm.set_power_save(enabled);
    }
    pub fn set_wake_override(&self, bits: u8) {
        self.psm.set_wake_override(bits);
    }

    pub fn mark_neighbor_awake(&self, addr: [u8; 6]) {
        self.psm.mark_neighbor_awake(addr);
    }
    pub fn is_neighbor_awake(&self, addr: &[u8; 6]) -> bool {
        self.psm.is_neighbor_awake(addr)
    }
}
