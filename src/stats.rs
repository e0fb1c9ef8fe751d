use portable_atomic::{AtomicU32, Ordering};

/// Event counters exposed for observability.
///
/// All counters are written from the interrupt context and read from
/// anywhere; they never wrap below and saturate arithmetic is not needed at
/// these rates.
#[derive(Default)]
pub struct Counters {
    /// Recoverable firmware errors reported through debug-text records.
    pub err_counter: AtomicU32,
    /// Firmware bug reports and driver invariant violations.
    pub bug_counter: AtomicU32,
    /// Operations force-cleared by the stale-lock reaper.
    pub recovered_stale_locks: AtomicU32,
    /// Command sequence gaps observed.
    pub sequence_gaps: AtomicU32,
    /// Received frames dropped (queue full, oversized, malformed).
    pub rx_dropped: AtomicU32,
    /// TX completions that arrived after their nominal window.
    pub late_atim_completions: AtomicU32,
}
impl Counters {
    pub const fn new() -> Self {
        Self {
            err_counter: AtomicU32::new(0),
            bug_counter: AtomicU32::new(0),
            recovered_stale_locks: AtomicU32::new(0),
            sequence_gaps: AtomicU32::new(0),
            rx_dropped: AtomicU32::new(0),
            late_atim_completions: AtomicU32::new(0),
        }
    }
    pub(crate) fn bump(counter: &AtomicU32) -> u32 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Relaxed)
    }
}
