use macro_bits::bit;
use portable_atomic::{AtomicU8, Ordering};

use crate::stats::Counters;

/// `busy` is set by the cooperative context when an operation starts and
/// cleared by the interrupt context when the matching completion arrives.
const BUSY: u8 = bit!(0);
/// Armed by the stale-lock reaper: the operation gets one more beacon
/// interval before it is force-cleared.
const CLEAR_AT_NEXT_TBTT: u8 = bit!(1);

/// Outcome of one reaper pass over a single flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Flag was idle, nothing done.
    Idle,
    /// Flag stays busy for one more beacon interval.
    Armed,
    /// The completion never arrived; the flag was forcibly released.
    ForceCleared,
}

/// One asynchronous operation-in-flight marker.
///
/// The single-writer rule applies: only the cooperative context calls
/// [`start`](Self::start), only the interrupt context calls
/// [`complete`](Self::complete) and [`reap`](Self::reap).
pub struct OperationFlag {
    state: AtomicU8,
}
impl OperationFlag {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }
    /// Mark the operation as started.
    ///
    /// Returns `false` if it was already busy, which callers treat as an
    /// overlapping-operation warning.
    pub fn start(&self) -> bool {
        self.state.fetch_or(BUSY, Ordering::AcqRel) & BUSY == 0
    }
    /// Resolve the operation. Clears the reaper arming along with `busy`.
    ///
    /// Returns `false` if the flag was not busy (a completion nobody was
    /// waiting for; logged by the caller, never an error).
    pub fn complete(&self) -> bool {
        self.state.swap(0, Ordering::AcqRel) & BUSY != 0
    }
    pub fn is_busy(&self) -> bool {
        self.state.load(Ordering::Acquire) & BUSY != 0
    }
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLEAR_AT_NEXT_TBTT != 0
    }
    /// One TBTT tick: grant a busy flag one more interval, then release it.
    fn reap(&self) -> ReapOutcome {
        let mut outcome = ReapOutcome::Idle;
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & BUSY == 0 {
                    outcome = ReapOutcome::Idle;
                    None
                } else if state & CLEAR_AT_NEXT_TBTT == 0 {
                    outcome = ReapOutcome::Armed;
                    Some(state | CLEAR_AT_NEXT_TBTT)
                } else {
                    outcome = ReapOutcome::ForceCleared;
                    Some(0)
                }
            });
        outcome
    }
}

/// The full set of in-flight markers the driver waits on.
pub struct OperationFlags {
    /// A data frame is on the wire, waiting for its TX status.
    pub tx_data_wait: OperationFlag,
    /// An ATIM frame is on the wire, waiting for its TX status.
    pub tx_atim_wait: OperationFlag,
    /// An asynchronous command transfer has not been acknowledged yet.
    pub cmd_async_lock: OperationFlag,
    /// A bulk TX transfer has not been acknowledged yet.
    pub tx_async_lock: OperationFlag,
}
impl OperationFlags {
    pub const fn new() -> Self {
        Self {
            tx_data_wait: OperationFlag::new(),
            tx_atim_wait: OperationFlag::new(),
            cmd_async_lock: OperationFlag::new(),
            tx_async_lock: OperationFlag::new(),
        }
    }
    /// The per-TBTT stale-lock pass.
    ///
    /// Any flag still busy from the previous interval is armed; any flag
    /// armed since the previous tick is force-cleared and the underlying
    /// operation counted as lost. The TBTT arrives well after every window
    /// in which a completion could legitimately show up, so a second-tick
    /// survivor means the response is gone for good.
    pub fn tick(&self, counters: &Counters) {
        let data = self.tx_data_wait.reap();
        let atim = self.tx_atim_wait.reap();
        let cmd = self.cmd_async_lock.reap();
        let bulk = self.tx_async_lock.reap();

        for (name, outcome) in [
            ("tx_data_wait", data),
            ("tx_atim_wait", atim),
            ("cmd_async_lock", cmd),
            ("tx_async_lock", bulk),
        ] {
            match outcome {
                ReapOutcome::Idle => {}
                ReapOutcome::Armed => debug!("{} still busy, clearing at next TBTT", name),
                ReapOutcome::ForceCleared => {
                    warn!("{} lost its completion, force-cleared", name);
                    Counters::bump(&counters.recovered_stale_locks);
                }
            }
        }
        // tx_data_wait and tx_atim_wait are mutually exclusive; losing both
        // in the same interval means the exclusion was already broken.
        if data == ReapOutcome::ForceCleared && atim == ReapOutcome::ForceCleared {
            error!("tx_data_wait and tx_atim_wait were busy at once");
            Counters::bump(&counters.bug_counter);
        }
    }
    /// Side-releases applied when a TX status record arrives.
    ///
    /// The firmware only reports TX status after the bulk transfer finished,
    /// so a pending `tx_async_lock` is provably stale at this point, as is a
    /// `cmd_async_lock` whose acknowledgement was suppressed by the same
    /// race.
    pub fn release_on_tx_status(&self) {
        if self.tx_async_lock.complete() {
            if self.cmd_async_lock.is_busy() {
                debug!("cmd_async_lock released by TX status");
                self.cmd_async_lock.complete();
            }
        }
    }
}
