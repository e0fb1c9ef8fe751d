//! Command sequencing and dispatch.
//!
//! The firmware numbers every command record it returns. The numbering is
//! strictly monotonic modulo the number of command buffers and never skips,
//! so an unexpected number is proof that responses were lost and that the
//! device state can no longer be trusted. Dispatch runs in interrupt
//! context and must stay cheap: traps are routed straight into the
//! power-save scheduler, everything else resolves a waiting flag or is
//! handed to the response callback.

use crate::{
    fwcmd::{
        CommandKind, CommandRecord, BUG_MAGIC, CMD_BCN_CTRL_ASYNC, CMD_PSM_ASYNC, CMD_REBOOT_ASYNC,
        CMD_WREG_ASYNC, ERR_MAGIC, RSP_ATIM, RSP_BEACON_CONFIG, RSP_BOOT, RSP_GPIO, RSP_HEXDUMP,
        RSP_PRETBTT, RSP_RADAR, RSP_TEXT, RSP_TXCOMP, RSP_WATCHDOG,
    },
    lock::OperationFlags,
    mac::{EventSink, InterfaceMode, RestartReason, WORK_REBUILD_BEACON},
    psm::PowerSave,
    stats::Counters,
    sync::WorkFlags,
};

/// Consecutive firmware errors tolerated before a restart is requested.
const FW_ERR_RESTART_THRESHOLD: u32 = 3;

/// Responses were lost: the received number does not continue the sequence.
///
/// Recoverable, but only by restarting the device; the caller owns that
/// path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceGap {
    pub expected: u32,
    pub received: u32,
}

/// What a successfully submitted record turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Dispatched {
    Tbtt,
    TxStatus,
    BeaconSent,
    AtimWindowEnd,
    Watchdog,
    DebugText,
    Boot,
    SyncResponse,
    AsyncAck,
    PsmAck,
    Ignored,
}

/// Tracks the response sequence and routes records to their handlers.
pub struct CommandSequencer {
    /// Next sequence number we expect; adopted from the first record.
    expected_seq: Option<u32>,
    num_cmd_buffers: u32,
    mode: InterfaceMode,
}
impl CommandSequencer {
    pub fn new(num_cmd_buffers: u8, mode: InterfaceMode) -> Self {
        Self {
            expected_seq: None,
            num_cmd_buffers: num_cmd_buffers.max(1) as u32,
            mode,
        }
    }
    /// The sequence is strictly monotonic and never skips, so any mismatch
    /// means lost responses.
    fn check_sequence(&mut self, seq: u32) -> Result<(), SequenceGap> {
        let expected = *self.expected_seq.get_or_insert(seq);
        if seq != expected {
            // Resynchronize so one lost response is reported once, not once
            // per subsequent record.
            self.expected_seq = Some((seq + 1) % self.num_cmd_buffers);
            return Err(SequenceGap {
                expected,
                received: seq,
            });
        }
        self.expected_seq = Some((expected + 1) % self.num_cmd_buffers);
        Ok(())
    }
    /// Submit one record for dispatch. Interrupt context.
    ///
    /// On a sequence gap the record is not dispatched; the gap is counted
    /// and a restart is requested through the sink.
    pub fn submit(
        &mut self,
        record: &CommandRecord,
        psm: &PowerSave,
        flags: &OperationFlags,
        work: &WorkFlags,
        counters: &Counters,
        sink: &dyn EventSink,
    ) -> Result<Dispatched, SequenceGap> {
        if let Err(gap) = self.check_sequence(record.sequence) {
            error!(
                "lost command responses: received {} while expecting {}",
                gap.received, gap.expected
            );
            Counters::bump(&counters.sequence_gaps);
            sink.restart_requested(RestartReason::LostResponse);
            return Err(gap);
        }
        let dispatched = match record.kind() {
            CommandKind::Sync => {
                sink.command_response(record);
                Dispatched::SyncResponse
            }
            CommandKind::Async => match record.opcode {
                // PSM acknowledgements are not routed through the response
                // callback; the RF transition bookkeeping happens here.
                CMD_PSM_ASYNC => {
                    psm.handle_ps_ack(counters, sink);
                    Dispatched::PsmAck
                }
                CMD_WREG_ASYNC | CMD_BCN_CTRL_ASYNC | CMD_REBOOT_ASYNC => {
                    trace!("async command acknowledged: {:02x}", record.opcode);
                    Dispatched::AsyncAck
                }
                _ => {
                    debug!("unexpected async acknowledgement: {:02x}", record.opcode);
                    Dispatched::AsyncAck
                }
            },
            CommandKind::Trap => self.dispatch_trap(record, psm, flags, work, counters, sink),
        };
        Ok(dispatched)
    }
    fn dispatch_trap(
        &self,
        record: &CommandRecord,
        psm: &PowerSave,
        flags: &OperationFlags,
        work: &WorkFlags,
        counters: &Counters,
        sink: &dyn EventSink,
    ) -> Dispatched {
        match record.opcode {
            RSP_PRETBTT => {
                match self.mode {
                    InterfaceMode::AdHoc => {
                        psm.handle_tbtt(record.payload, flags, work, counters, sink)
                    }
                    // An infrastructure station only learns about RF
                    // transitions from this trap.
                    InterfaceMode::Station => psm.handle_ps_ack(counters, sink),
                    InterfaceMode::AccessPoint => {
                        work.set(WORK_REBUILD_BEACON);
                    }
                }
                Dispatched::Tbtt
            }
            RSP_TXCOMP => {
                psm.handle_tx_status(flags, counters);
                Dispatched::TxStatus
            }
            RSP_BEACON_CONFIG => {
                psm.handle_beacon_sent(record.payload);
                Dispatched::BeaconSent
            }
            RSP_ATIM => {
                psm.handle_atim_window_end(sink);
                Dispatched::AtimWindowEnd
            }
            RSP_WATCHDOG => {
                error!("watchdog trap received, the device must restart");
                sink.restart_requested(RestartReason::Watchdog);
                Dispatched::Watchdog
            }
            RSP_TEXT => {
                self.handle_debug_text(record.payload, counters, sink);
                Dispatched::DebugText
            }
            RSP_BOOT => {
                info!("firmware booted");
                sink.firmware_booted();
                Dispatched::Boot
            }
            RSP_HEXDUMP | RSP_RADAR | RSP_GPIO => {
                debug!("unused trap: {:02x}", record.opcode);
                Dispatched::Ignored
            }
            _ => {
                warn!("cannot handle trap {:02x}", record.opcode);
                Dispatched::Ignored
            }
        }
    }
    /// Firmware debug text doubles as its error reporting channel.
    fn handle_debug_text(&self, text: &[u8], counters: &Counters, sink: &dyn EventSink) {
        if text.len() > 3 {
            if &text[..3] == ERR_MAGIC {
                if Counters::bump(&counters.err_counter) > FW_ERR_RESTART_THRESHOLD {
                    sink.restart_requested(RestartReason::TooManyFirmwareErrors);
                }
            } else if &text[..3] == BUG_MAGIC {
                Counters::bump(&counters.bug_counter);
                sink.restart_requested(RestartReason::FatalFirmwareError);
            }
        }
        if let Ok(text) = core::str::from_utf8(text) {
            debug!("firmware: {}", text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::NullSink;
    use core::cell::{Cell, RefCell};
    use embassy_time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        responses: Cell<usize>,
        restarts: RefCell<std::vec::Vec<RestartReason>>,
    }
    impl EventSink for RecordingSink {
        fn command_response(&self, _record: &CommandRecord) {
            self.responses.set(self.responses.get() + 1);
        }
        fn restart_requested(&self, reason: RestartReason) {
            self.restarts.borrow_mut().push(reason);
        }
    }

    struct Harness {
        psm: PowerSave,
        flags: OperationFlags,
        work: WorkFlags,
        counters: Counters,
    }
    impl Harness {
        fn new() -> Self {
            Self {
                psm: PowerSave::new(true, Duration::from_micros(2000)),
                flags: OperationFlags::new(),
                work: WorkFlags::new(),
                counters: Counters::new(),
            }
        }
        fn submit(
            &self,
            sequencer: &mut CommandSequencer,
            record: &CommandRecord,
            sink: &dyn EventSink,
        ) -> Result<Dispatched, SequenceGap> {
            sequencer.submit(
                record,
                &self.psm,
                &self.flags,
                &self.work,
                &self.counters,
                sink,
            )
        }
    }

    fn trap(opcode: u8, sequence: u32) -> CommandRecord<'static> {
        CommandRecord {
            opcode,
            sequence,
            ext: 0,
            payload: &[0, 0, 0, 0],
        }
    }

    #[test]
    fn consecutive_sequences_raise_no_gap() {
        let harness = Harness::new();
        let mut sequencer = CommandSequencer::new(4, InterfaceMode::AdHoc);
        // Adoption starts wherever the firmware happens to be, and the
        // numbering wraps at the command buffer count.
        for seq in [2, 3, 0, 1, 2, 3, 0] {
            assert!(harness
                .submit(&mut sequencer, &trap(RSP_TXCOMP, seq), &NullSink)
                .is_ok());
        }
        assert_eq!(Counters::get(&harness.counters.sequence_gaps), 0);
    }

    #[test]
    fn single_skip_raises_exactly_one_gap() {
        let harness = Harness::new();
        let sink = RecordingSink::default();
        let mut sequencer = CommandSequencer::new(8, InterfaceMode::AdHoc);
        let mut gaps = 0;
        for seq in [0, 1, 3, 4, 5] {
            if harness
                .submit(&mut sequencer, &trap(RSP_TXCOMP, seq), &sink)
                .is_err()
            {
                gaps += 1;
            }
        }
        assert_eq!(gaps, 1);
        assert_eq!(Counters::get(&harness.counters.sequence_gaps), 1);
        assert_eq!(*sink.restarts.borrow(), [RestartReason::LostResponse]);
    }

    #[test]
    fn single_repeat_raises_exactly_one_gap() {
        let harness = Harness::new();
        let mut sequencer = CommandSequencer::new(8, InterfaceMode::AdHoc);
        let mut gaps = 0;
        for seq in [0, 1, 1, 2, 3] {
            if harness
                .submit(&mut sequencer, &trap(RSP_TXCOMP, seq), &NullSink)
                .is_err()
            {
                gaps += 1;
            }
        }
        assert_eq!(gaps, 1);
    }

    #[test]
    fn tbtt_trap_drives_the_power_save_scheduler() {
        let harness = Harness::new();
        let mut sequencer = CommandSequencer::new(4, InterfaceMode::AdHoc);
        let dispatched = harness
            .submit(&mut sequencer, &trap(RSP_PRETBTT, 0), &NullSink)
            .unwrap();
        assert_eq!(dispatched, Dispatched::Tbtt);
        assert_eq!(harness.psm.beacon_cycles(), 1);
        assert_eq!(
            harness.psm.state().phase,
            crate::psm::PsmPhase::PreTbtt
        );
    }

    #[test]
    fn sync_records_reach_the_response_callback() {
        let harness = Harness::new();
        let sink = RecordingSink::default();
        let mut sequencer = CommandSequencer::new(4, InterfaceMode::AdHoc);
        let record = CommandRecord {
            opcode: crate::fwcmd::CMD_WREG,
            sequence: 0,
            ext: 0,
            payload: &[],
        };
        assert_eq!(
            harness.submit(&mut sequencer, &record, &sink),
            Ok(Dispatched::SyncResponse)
        );
        assert_eq!(sink.responses.get(), 1);
    }

    #[test]
    fn repeated_firmware_errors_request_a_restart() {
        let harness = Harness::new();
        let sink = RecordingSink::default();
        let mut sequencer = CommandSequencer::new(16, InterfaceMode::AdHoc);
        for seq in 0..4u32 {
            let record = CommandRecord {
                opcode: RSP_TEXT,
                sequence: seq,
                ext: 0,
                payload: b"ERR: rx path stalled",
            };
            harness.submit(&mut sequencer, &record, &sink).unwrap();
        }
        assert_eq!(Counters::get(&harness.counters.err_counter), 4);
        assert_eq!(
            *sink.restarts.borrow(),
            [RestartReason::TooManyFirmwareErrors]
        );

        let record = CommandRecord {
            opcode: RSP_TEXT,
            sequence: 4,
            ext: 0,
            payload: b"BUG: tx ring corrupt",
        };
        harness.submit(&mut sequencer, &record, &sink).unwrap();
        assert_eq!(Counters::get(&harness.counters.bug_counter), 1);
        assert_eq!(
            sink.restarts.borrow().last(),
            Some(&RestartReason::FatalFirmwareError)
        );
    }

    #[test]
    fn access_point_tbtt_schedules_a_beacon_rebuild() {
        let harness = Harness::new();
        let mut sequencer = CommandSequencer::new(4, InterfaceMode::AccessPoint);
        harness
            .submit(&mut sequencer, &trap(RSP_PRETBTT, 0), &NullSink)
            .unwrap();
        assert_ne!(harness.work.peek() & WORK_REBUILD_BEACON, 0);
        // The ad-hoc window machinery stays untouched.
        assert_eq!(harness.psm.beacon_cycles(), 0);
    }
}
