//! Power-save and beacon-timing state machine.
//!
//! In ad-hoc power-save mode the beacon interval is carved into windows: a
//! short pre-TBTT period, the ATIM window in which stations announce pending
//! traffic, the data transmission window and finally the soft-beacon window.
//! The RF may only be powered down outside the announcement periods, and a
//! TBTT must always find the device awake, otherwise the cell loses beacon
//! synchronization. This module tracks the `(rf, phase)` pair, applies the
//! window transitions and decides whether a sleep request may be honored.
//!
//! The phase only ever advances along
//! `PreTbtt -> AtimWindow -> TxWindow -> SoftBcnWindow -> PreTbtt`. With
//! power save disabled the device sits in `TxWindow` permanently.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;
use heapless::Vec;
use macro_bits::bit;

use crate::{
    lock::OperationFlags,
    mac::{EventSink, WORK_CLEAR_ROSTER, WORK_FIRST_BEACON, WORK_REBUILD_ATIMS},
    stats::Counters,
    sync::WorkFlags,
    DefaultRawMutex,
};

/// RF power state of the radio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RfState {
    #[default]
    Wake,
    Sleep,
}

/// Beacon-relative window the device currently operates in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PsmPhase {
    /// Between the TBTT trap and the start of the ATIM window.
    PreTbtt,
    /// Traffic announcement window.
    AtimWindow,
    /// Data transmission window.
    #[default]
    TxWindow,
    /// Software beaconing period at the tail of the interval.
    SoftBcnWindow,
}

/// Snapshot of the power-save state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PsmState {
    pub rf: RfState,
    pub phase: PsmPhase,
}

/// Reasons to keep the RF powered regardless of the configured mode.
///
/// A beacon received from the cell keeps us awake for the rest of the
/// interval; so does an interface that opted out of power save.
pub const PS_OFF_BCN: u8 = bit!(0);
pub const PS_OFF_VIF: u8 = bit!(1);

/// Why a sleep or wake request was not honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PsmError {
    /// Sleeping is only allowed in the TX and soft-beacon windows.
    WrongPhase,
    /// A TX completion is still outstanding and would be invalidated.
    OperationPending,
    /// A transition is already in flight, awaiting its confirmation.
    TransitionPending,
    /// The RF is already in the requested state.
    AlreadyThere,
}

const MAX_AWAKE_NEIGHBORS: usize = 16;

struct PsmInner {
    rf: RfState,
    phase: PsmPhase,
    /// TBTT traps seen since the cell was joined.
    beacon_cycles: u32,
    ps_enabled: bool,
    wake_override: u8,
    transit_to_sleep: bool,
    transit_to_wake: bool,
    /// Stations that answered our ATIM or announced traffic this interval.
    awake_neighbors: Vec<[u8; 6], MAX_AWAKE_NEIGHBORS>,
}

/// The power-save scheduler.
///
/// Interrupt-context entry points (`handle_*`) resolve completions and
/// advance the phase; cooperative-context entry points (`request_*`,
/// `ps_update`, roster maintenance) initiate operations. Neither side does
/// the other's half, which is what keeps this lock-free in spirit even
/// though a blocking mutex guards the plain fields.
pub struct PowerSave {
    inner: Mutex<DefaultRawMutex, RefCell<PsmInner>>,
    atim_window_offset: Duration,
}
impl PowerSave {
    pub fn new(ps_enabled: bool, atim_window_offset: Duration) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(PsmInner {
                rf: RfState::Wake,
                phase: PsmPhase::TxWindow,
                beacon_cycles: 0,
                ps_enabled,
                wake_override: 0,
                transit_to_sleep: false,
                transit_to_wake: false,
                awake_neighbors: Vec::new(),
            })),
            atim_window_offset,
        }
    }
    pub fn state(&self) -> PsmState {
        self.inner.lock(|inner| {
            let inner = inner.borrow();
            PsmState {
                rf: inner.rf,
                phase: inner.phase,
            }
        })
    }
    pub fn beacon_cycles(&self) -> u32 {
        self.inner.lock(|inner| inner.borrow().beacon_cycles)
    }
    pub fn power_save_enabled(&self) -> bool {
        self.inner.lock(|inner| inner.borrow().ps_enabled)
    }

    /// TBTT trap handler. Interrupt context, bounded cost.
    ///
    /// The payload's first word carries the RF state the firmware woke up
    /// with; zero means powered up.
    pub fn handle_tbtt(
        &self,
        payload: &[u8],
        flags: &OperationFlags,
        work: &WorkFlags,
        counters: &Counters,
        sink: &dyn EventSink,
    ) {
        let hw_asleep = match payload.first_chunk::<4>() {
            Some(word) => u32::from_le_bytes(*word) != 0,
            None => {
                warn!("TBTT trap without an RF state word");
                false
            }
        };
        if hw_asleep {
            error!("firmware woke up at TBTT with the RF still powered down");
        }

        let notify = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.beacon_cycles += 1;
            if inner.beacon_cycles == 1 {
                // The cell is joined once the first beacon went out; beacon
                // control setup and the joined notification run outside the
                // interrupt.
                work.set(WORK_FIRST_BEACON);
            }

            if inner.rf == RfState::Sleep {
                // Sleeping through a TBTT breaks IBSS synchronization, so
                // whatever state we thought we were in is wrong. Back to the
                // known-safe state.
                error!("TBTT while the RF was considered asleep, forcing wake");
                Counters::bump(&counters.err_counter);
                inner.rf = RfState::Wake;
                inner.phase = PsmPhase::TxWindow;
                inner.transit_to_sleep = false;
                inner.transit_to_wake = false;
            }

            if !matches!(inner.phase, PsmPhase::TxWindow | PsmPhase::SoftBcnWindow) {
                error!("TBTT arrived in phase {}", inner.phase as u8);
            }

            if inner.ps_enabled {
                inner.wake_override = 0;
                inner.phase = PsmPhase::PreTbtt;
                let overrun = work.set(WORK_REBUILD_ATIMS | WORK_CLEAR_ROSTER);
                if overrun != 0 {
                    error!("previous interval's deferred work was never drained");
                }
                true
            } else {
                // Without power save there are no windows to keep.
                false
            }
        });

        // One beacon interval is the unit of every async timeout.
        flags.tick(counters);

        if notify {
            sink.arm_atim_timer(self.atim_window_offset);
            sink.psm_state_changed(self.state());
        }
    }

    /// TX status handler: resolve the one wait flag the current phase says
    /// this completion belongs to. Interrupt context.
    pub fn handle_tx_status(
        &self,
        flags: &OperationFlags,
        counters: &Counters,
    ) {
        let phase = self.state().phase;
        match phase {
            PsmPhase::AtimWindow => {
                if flags.tx_atim_wait.complete() {
                    trace!("ATIM status received");
                } else if flags.tx_data_wait.complete() {
                    // A data frame sent late in the previous interval got its
                    // acknowledgement suppressed until now.
                    warn!("data TX status arrived inside the ATIM window");
                } else {
                    warn!("TX status with no operation waiting");
                }
            }
            PsmPhase::TxWindow | PsmPhase::SoftBcnWindow | PsmPhase::PreTbtt => {
                if flags.tx_atim_wait.complete() {
                    // Sent right before the window closed; still counts as
                    // delivered, but worth keeping score of.
                    Counters::bump(&counters.late_atim_completions);
                    debug!("ATIM status arrived after the ATIM window ended");
                } else if flags.tx_data_wait.complete() {
                    trace!("data TX status received");
                } else {
                    warn!("TX status with no operation waiting");
                }
            }
        }
        flags.release_on_tx_status();
    }

    /// Beacon-sent trap handler. Interrupt context.
    pub fn handle_beacon_sent(&self, _payload: &[u8]) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.ps_enabled {
                // A beacon of ours went out; stay awake for this interval so
                // the neighbors that heard it can reach us.
                inner.wake_override |= PS_OFF_BCN;
            }
            if inner.rf == RfState::Sleep {
                warn!("beacon-sent trap while the RF is powered down");
            }
        });
    }

    /// The ATIM-window-start timer fired. May run in interrupt context.
    pub fn atim_window_started(&self, sink: &dyn EventSink) {
        let advanced = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.phase == PsmPhase::PreTbtt {
                inner.phase = PsmPhase::AtimWindow;
                true
            } else {
                warn!("ATIM window opened in phase {}", inner.phase as u8);
                false
            }
        });
        if advanced {
            sink.psm_state_changed(self.state());
        }
    }

    /// ATIM-end trap handler: the device closed the announcement window.
    pub fn handle_atim_window_end(&self, sink: &dyn EventSink) {
        let advanced = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            match inner.phase {
                PsmPhase::AtimWindow => {
                    inner.phase = PsmPhase::TxWindow;
                    true
                }
                // With power save off the trap is expected noise.
                _ if !inner.ps_enabled => false,
                _ => {
                    warn!("ATIM end trap in phase {}", inner.phase as u8);
                    false
                }
            }
        });
        if advanced {
            sink.psm_state_changed(self.state());
        }
    }

    /// The beacon collaborator opened the software beaconing period.
    pub fn begin_soft_beacon_window(&self, sink: &dyn EventSink) {
        let advanced = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.phase == PsmPhase::TxWindow {
                inner.phase = PsmPhase::SoftBcnWindow;
                true
            } else {
                warn!("soft beacon window requested in phase {}", inner.phase as u8);
                false
            }
        });
        if advanced {
            sink.psm_state_changed(self.state());
        }
    }

    /// PSM command acknowledgement: the RF transition we scheduled has been
    /// carried out by the firmware. Interrupt context.
    ///
    /// The acknowledgement does not carry the resulting state, it only
    /// confirms that the transition completed; the direction comes from the
    /// transit marker set when the command was issued.
    pub fn handle_ps_ack(&self, counters: &Counters, sink: &dyn EventSink) {
        let changed = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.transit_to_sleep && inner.transit_to_wake {
                error!("both PSM transit markers set, resetting to wake");
                Counters::bump(&counters.bug_counter);
                inner.transit_to_sleep = false;
                inner.transit_to_wake = false;
                inner.rf = RfState::Wake;
                inner.phase = PsmPhase::TxWindow;
                return true;
            }
            if inner.transit_to_sleep {
                inner.transit_to_sleep = false;
                inner.rf = RfState::Sleep;
                true
            } else if inner.transit_to_wake {
                inner.transit_to_wake = false;
                if inner.rf == RfState::Wake {
                    error!("wake confirmation but the RF was never marked asleep");
                }
                inner.rf = RfState::Wake;
                true
            } else {
                warn!("PSM acknowledgement without a pending transition");
                false
            }
        });
        if changed {
            sink.psm_state_changed(self.state());
        }
    }

    /// Ask to power the RF down. Cooperative context.
    ///
    /// Honored only in the TX and soft-beacon windows and only while no TX
    /// completion is outstanding; the caller must then issue the PSM command
    /// whose acknowledgement completes the transition.
    pub fn request_sleep(&self, flags: &OperationFlags) -> Result<(), PsmError> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if !matches!(inner.phase, PsmPhase::TxWindow | PsmPhase::SoftBcnWindow) {
                return Err(PsmError::WrongPhase);
            }
            if flags.tx_data_wait.is_busy() || flags.tx_atim_wait.is_busy() {
                return Err(PsmError::OperationPending);
            }
            if inner.transit_to_sleep || inner.transit_to_wake {
                return Err(PsmError::TransitionPending);
            }
            if inner.rf == RfState::Sleep {
                return Err(PsmError::AlreadyThere);
            }
            inner.transit_to_sleep = true;
            Ok(())
        })
    }

    /// Ask to power the RF back up. Cooperative context.
    pub fn request_wake(&self) -> Result<(), PsmError> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.transit_to_sleep || inner.transit_to_wake {
                return Err(PsmError::TransitionPending);
            }
            if inner.rf == RfState::Wake {
                return Err(PsmError::AlreadyThere);
            }
            inner.transit_to_wake = true;
            Ok(())
        })
    }

    /// Recompute the RF state the configuration asks for.
    ///
    /// Returns the state a transition should be scheduled towards, if any.
    /// Cooperative context; the caller issues the PSM command and the
    /// matching acknowledgement drives [`handle_ps_ack`](Self::handle_ps_ack).
    pub fn ps_update(&self, flags: &OperationFlags) -> Option<RfState> {
        let (current, wanted) = self.inner.lock(|inner| {
            let inner = inner.borrow();
            let wanted = if inner.wake_override != 0 || !inner.ps_enabled {
                RfState::Wake
            } else {
                RfState::Sleep
            };
            (inner.rf, wanted)
        });
        if current == wanted {
            return None;
        }
        let requested = match wanted {
            RfState::Sleep => self.request_sleep(flags),
            RfState::Wake => self.request_wake(),
        };
        match requested {
            Ok(()) => Some(wanted),
            Err(err) => {
                debug!("RF transition deferred: {}", err as u8);
                None
            }
        }
    }

    /// Raise a reason to keep the RF up for the rest of the interval.
    pub fn set_wake_override(&self, bits: u8) {
        self.inner
            .lock(|inner| inner.borrow_mut().wake_override |= bits);
    }
    pub fn set_power_save(&self, enabled: bool) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.ps_enabled = enabled;
            if !enabled {
                inner.phase = PsmPhase::TxWindow;
            }
        });
    }

    /// Record a neighbor that will stay awake through the coming data
    /// window. Cooperative context.
    pub fn mark_neighbor_awake(&self, addr: [u8; 6]) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.awake_neighbors.contains(&addr) {
                return;
            }
            if inner.awake_neighbors.push(addr).is_err() {
                warn!("awake-neighbor roster full, dropping entry");
            }
        });
    }
    pub fn is_neighbor_awake(&self, addr: &[u8; 6]) -> bool {
        self.inner
            .lock(|inner| inner.borrow().awake_neighbors.contains(addr))
    }
    /// Forget last interval's roster. Cooperative context, runs when the
    /// TBTT handler flags [`WORK_CLEAR_ROSTER`].
    pub fn clear_awake_neighbors(&self) {
        self.inner
            .lock(|inner| inner.borrow_mut().awake_neighbors.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::NullSink;

    fn ps() -> PowerSave {
        PowerSave::new(true, Duration::from_micros(2000))
    }

    fn tbtt(psm: &PowerSave, flags: &OperationFlags, work: &WorkFlags, counters: &Counters) {
        psm.handle_tbtt(&0u32.to_le_bytes(), flags, work, counters, &NullSink);
    }

    #[test]
    fn initial_state_is_wake_tx_window() {
        assert_eq!(
            ps().state(),
            PsmState {
                rf: RfState::Wake,
                phase: PsmPhase::TxWindow
            }
        );
    }

    #[test]
    fn phase_cycles_forward_through_the_interval() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(psm.state().phase, PsmPhase::PreTbtt);
        psm.atim_window_started(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::AtimWindow);
        psm.handle_atim_window_end(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::TxWindow);
        psm.begin_soft_beacon_window(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::SoftBcnWindow);
        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(psm.state().phase, PsmPhase::PreTbtt);
        assert_eq!(psm.beacon_cycles(), 2);
    }

    #[test]
    fn phase_never_regresses() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        tbtt(&psm, &flags, &work, &counters);
        psm.atim_window_started(&NullSink);
        // A stray timer or trap must not move the phase backwards.
        psm.atim_window_started(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::AtimWindow);
        psm.handle_atim_window_end(&NullSink);
        psm.begin_soft_beacon_window(&NullSink);
        psm.handle_atim_window_end(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::SoftBcnWindow);
    }

    #[test]
    fn power_save_disabled_pins_tx_window() {
        let psm = PowerSave::new(false, Duration::from_micros(2000));
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(psm.state().phase, PsmPhase::TxWindow);
        psm.handle_atim_window_end(&NullSink);
        assert_eq!(psm.state().phase, PsmPhase::TxWindow);
        assert_eq!(psm.beacon_cycles(), 1);
    }

    #[test]
    fn first_tbtt_schedules_bootstrap_work() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        tbtt(&psm, &flags, &work, &counters);
        assert_ne!(work.peek() & WORK_FIRST_BEACON, 0);
        let _ = work.take();
        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(work.peek() & WORK_FIRST_BEACON, 0);
    }

    #[test]
    fn tbtt_while_asleep_forces_wake() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        psm.request_sleep(&flags).unwrap();
        psm.handle_ps_ack(&counters, &NullSink);
        assert_eq!(psm.state().rf, RfState::Sleep);

        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(psm.state().rf, RfState::Wake);
        assert_eq!(Counters::get(&counters.err_counter), 1);
    }

    #[test]
    fn sleep_requires_quiet_tx_window() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        assert_eq!(psm.request_sleep(&flags), Ok(()));
        psm.handle_ps_ack(&counters, &NullSink);
        psm.request_wake().unwrap();
        psm.handle_ps_ack(&counters, &NullSink);

        // Busy data wait blocks the request.
        flags.tx_data_wait.start();
        assert_eq!(psm.request_sleep(&flags), Err(PsmError::OperationPending));
        flags.tx_data_wait.complete();

        // Outside the TX windows the request is refused as well.
        tbtt(&psm, &flags, &work, &counters);
        assert_eq!(psm.request_sleep(&flags), Err(PsmError::WrongPhase));
    }

    #[test]
    fn transitions_wait_for_their_acknowledgement() {
        let psm = ps();
        let flags = OperationFlags::new();
        let counters = Counters::new();

        psm.request_sleep(&flags).unwrap();
        // Not confirmed yet.
        assert_eq!(psm.state().rf, RfState::Wake);
        assert_eq!(psm.request_sleep(&flags), Err(PsmError::TransitionPending));
        psm.handle_ps_ack(&counters, &NullSink);
        assert_eq!(psm.state().rf, RfState::Sleep);
        // A stray acknowledgement is a warning, not a state change.
        psm.handle_ps_ack(&counters, &NullSink);
        assert_eq!(psm.state().rf, RfState::Sleep);
    }

    #[test]
    fn tx_status_resolution_follows_the_phase() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        tbtt(&psm, &flags, &work, &counters);
        psm.atim_window_started(&NullSink);
        flags.tx_atim_wait.start();
        psm.handle_tx_status(&flags, &counters);
        assert!(!flags.tx_atim_wait.is_busy());
        assert_eq!(Counters::get(&counters.late_atim_completions), 0);

        psm.handle_atim_window_end(&NullSink);
        flags.tx_data_wait.start();
        psm.handle_tx_status(&flags, &counters);
        assert!(!flags.tx_data_wait.is_busy());

        // An ATIM acknowledged after its window closed is late.
        flags.tx_atim_wait.start();
        psm.handle_tx_status(&flags, &counters);
        assert!(!flags.tx_atim_wait.is_busy());
        assert_eq!(Counters::get(&counters.late_atim_completions), 1);
    }

    #[test]
    fn beacon_sent_overrides_sleep_for_the_interval() {
        let psm = ps();
        let flags = OperationFlags::new();
        let work = WorkFlags::new();
        let counters = Counters::new();

        psm.handle_beacon_sent(&[1, 0]);
        assert_eq!(psm.ps_update(&flags), None);

        // The override is dropped at the next TBTT, so sleeping becomes an
        // option again once the windows have run their course.
        tbtt(&psm, &flags, &work, &counters);
        psm.atim_window_started(&NullSink);
        psm.handle_atim_window_end(&NullSink);
        assert_eq!(psm.ps_update(&flags), Some(RfState::Sleep));
    }

    #[test]
    fn awake_neighbor_roster_round_trip() {
        let psm = ps();
        let a = [2, 0, 0, 0, 0, 1];
        let b = [2, 0, 0, 0, 0, 2];
        psm.mark_neighbor_awake(a);
        psm.mark_neighbor_awake(a);
        assert!(psm.is_neighbor_awake(&a));
        assert!(!psm.is_neighbor_awake(&b));
        psm.clear_awake_neighbors();
        assert!(!psm.is_neighbor_awake(&a));
    }
}
