//! # `otus-mac`
//! Control core of an IBSS (ad-hoc) driver for AR9170-class USB Wi-Fi
//! radios. The transport, the 802.11 frame codec and the upper network
//! stack live elsewhere; this crate owns the three pieces that are timing-
//! and safety-critical.
//!
//! ## Hardware overview
//! This chapter gives a short overview of how the device talks to us.
//!
//! ### Response stream
//! The firmware merges everything it has to say into a single byte stream
//! per bulk transfer: received frames, command responses and unsolicited
//! traps, back to back and without alignment. Command clusters are
//! introduced by a fixed fifteen byte marker; whatever sits outside a
//! cluster is frame data. [ResponseStream] splits one such buffer into its
//! segments, in stream order, and [AdHocMac::handle_response_buffer] feeds
//! the command records through the sequence check into dispatch. Every
//! record carries a sequence number that is strictly consecutive modulo the
//! firmware's command buffer count; a gap means responses were lost and the
//! device can no longer be trusted.
//!
//! ### Beacon timing and power save
//! In an ad-hoc cell every station keeps the same beacon clock. The
//! firmware raises a trap at every target beacon transmission time (TBTT);
//! from there the interval runs through the ATIM announcement window into
//! the data window and the software beaconing period. The RF may only
//! sleep outside the announcement phases, and every transition is first
//! requested, then confirmed by the firmware. [PowerSave] keeps that state
//! machine; lost completions are bounded by the TBTT tick through the
//! stale-lock reaper, so no wait can outlive two beacon intervals.
//!
//! ### Firmware descriptors
//! The device boots a firmware image that describes itself through a chain
//! of magic-tagged descriptors appended to the code. [parse_firmware]
//! validates the chain before anything else runs and distills it into an
//! immutable [Capabilities] record; a malformed or hostile image never
//! reaches the hardware.
//!
//! ## Execution contexts
//! Interrupt-context entry points are cheap and bounded; everything
//! expensive is flagged for the single-threaded cooperative scheduler.
//! The cooperative side only ever *starts* operations, the interrupt side
//! only ever *resolves* them, which keeps the shared flags race-free
//! without real locks.

#![no_std]
pub(crate) mod fmt;

#[cfg(test)]
extern crate std;

mod cmd;
pub mod fwcmd;
mod fwdesc;
mod lock;
mod mac;
mod psm;
mod queue;
mod rx;
mod stats;
mod sync;

pub use cmd::{CommandSequencer, Dispatched, SequenceGap};
pub use fwcmd::{CommandKind, CommandRecord};
pub use fwdesc::{parse_firmware, Capabilities, FirmwareError, FirmwareFeatures, FirmwareResult};
pub use lock::{OperationFlag, OperationFlags, ReapOutcome};
pub use mac::*;
pub use psm::{PowerSave, PsmError, PsmPhase, PsmState, RfState, PS_OFF_BCN, PS_OFF_VIF};
pub use queue::{EnqueueError, RxQueueResources};
pub use rx::{ResponseStream, RxSegment};
pub use stats::Counters;
pub use sync::{SignalQueue, WorkFlags};

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
