use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU8, AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// A synchronization primitive, which allows queueing a number of signals, to
/// be awaited.
///
/// The interrupt context queues one signal per received data frame; the
/// cooperative context drains them.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queued signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Relaxed);
    }
    /// Asynchronously wait for the next signal.
    pub async fn next(&self) {
        poll_fn(|cx| {
            let queued_signals = self.queued_signals.load(Ordering::Relaxed);
            if queued_signals == 0 {
                self.waker.register(cx.waker());
                Poll::Pending
            } else {
                self.queued_signals
                    .store(queued_signals - 1, Ordering::Relaxed);
                Poll::Ready(())
            }
        })
        .await
    }
}

/// A word of deferred-work bits, set by the interrupt context and drained by
/// the cooperative scheduler.
///
/// Work that is too expensive for the interrupt context (ATIM frame
/// construction, roster clearing, beacon control setup) is flagged here and
/// picked up once the interrupt handler has returned.
pub struct WorkFlags {
    bits: AtomicU8,
    waker: AtomicWaker,
}
impl WorkFlags {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
            waker: AtomicWaker::new(),
        }
    }
    /// Mark the given work bits as pending.
    ///
    /// Returns the bits that were already pending, so callers can detect an
    /// overrun (the previous round of work was never drained).
    pub fn set(&self, bits: u8) -> u8 {
        let previous = self.bits.fetch_or(bits, Ordering::Relaxed);
        self.waker.wake();
        previous & bits
    }
    /// Take all currently pending work bits, clearing them.
    pub fn take(&self) -> u8 {
        self.bits.swap(0, Ordering::Relaxed)
    }
    /// Check for pending bits without clearing them.
    pub fn peek(&self) -> u8 {
        self.bits.load(Ordering::Relaxed)
    }
    /// Asynchronously wait until at least one work bit is pending, then take
    /// the whole set.
    pub fn wait(&self) -> impl Future<Output = u8> + use<'_> {
        poll_fn(|cx| {
            let bits = self.take();
            if bits == 0 {
                self.waker.register(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(bits)
            }
        })
    }
}
