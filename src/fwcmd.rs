//! Wire-level constants of the firmware command interface.
//!
//! The response marker bytes, the command header layout and the OID values
//! are fixed by the firmware; they must match bit-exactly for the hardware
//! to remain intelligible.

/// Marker the firmware places in the response stream right before a command
/// cluster: three framing bytes followed by twelve `0xff` bytes.
///
/// Hardware framing is not word-aligned, so during demux the `0xff` sentinel
/// may be met at any of the twelve trailing positions of this marker.
pub const RSP_MAGIC: [u8; RSP_MAGIC_LEN] = [
    0x00, 0x00, 0x4e, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];
pub const RSP_MAGIC_LEN: usize = 15;
pub const RSP_MAGIC_FF_LEN: usize = 12;
pub const RSP_MAGIC_NON_FF_LEN: usize = RSP_MAGIC_LEN - RSP_MAGIC_FF_LEN;

/// Length of the command header: `{len, oid, seq, ext}`.
pub const CMD_HDR_LEN: usize = 4;

/// OID bit marking a hardware trap (an unsolicited event).
pub const RSP_FLAG: u8 = 0xc0;
/// OID bit marking an asynchronous command response.
pub const CMD_ASYNC_FLAG: u8 = 0x40;

// Synchronous command OIDs relevant to this core.
pub const CMD_WREG: u8 = 0x01;
pub const CMD_REBOOT: u8 = 0x04;
pub const CMD_BCN_CTRL: u8 = 0x05;
pub const CMD_PSM: u8 = 0x24;

// Their asynchronous flavors.
pub const CMD_WREG_ASYNC: u8 = CMD_WREG | CMD_ASYNC_FLAG;
pub const CMD_REBOOT_ASYNC: u8 = CMD_REBOOT | CMD_ASYNC_FLAG;
pub const CMD_BCN_CTRL_ASYNC: u8 = CMD_BCN_CTRL | CMD_ASYNC_FLAG;
pub const CMD_PSM_ASYNC: u8 = CMD_PSM | CMD_ASYNC_FLAG;

// Hardware traps.
pub const RSP_PRETBTT: u8 = 0xc0;
pub const RSP_TXCOMP: u8 = 0xc1;
pub const RSP_BEACON_CONFIG: u8 = 0xc2;
pub const RSP_ATIM: u8 = 0xc3;
pub const RSP_WATCHDOG: u8 = 0xc6;
pub const RSP_TEXT: u8 = 0xca;
pub const RSP_HEXDUMP: u8 = 0xcc;
pub const RSP_RADAR: u8 = 0xcd;
pub const RSP_GPIO: u8 = 0xce;
pub const RSP_BOOT: u8 = 0xcf;

/// Prefix of a firmware debug-text record reporting a recoverable error.
pub const ERR_MAGIC: &[u8; 3] = b"ERR";
/// Prefix of a firmware debug-text record reporting a firmware bug.
pub const BUG_MAGIC: &[u8; 3] = b"BUG";

/// How a command record wants to be treated by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandKind {
    /// Response to a command the driver is synchronously waiting on.
    Sync,
    /// Response to a fire-and-forget command.
    Async,
    /// Unsolicited hardware event.
    Trap,
}

/// One parsed command record, borrowing its payload from the response buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandRecord<'a> {
    pub opcode: u8,
    pub sequence: u32,
    pub ext: u8,
    pub payload: &'a [u8],
}
impl<'a> CommandRecord<'a> {
    /// Parse one record off the front of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupies, or `None` if
    /// the header is clipped or the declared length runs past `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Option<(Self, usize)> {
        if bytes.len() < CMD_HDR_LEN {
            return None;
        }
        let declared_len = bytes[0] as usize;
        let total = CMD_HDR_LEN + declared_len;
        if total > bytes.len() {
            return None;
        }
        Some((
            Self {
                opcode: bytes[1],
                sequence: bytes[2] as u32,
                ext: bytes[3],
                payload: &bytes[CMD_HDR_LEN..total],
            },
            total,
        ))
    }
    pub fn kind(&self) -> CommandKind {
        if self.opcode & RSP_FLAG == RSP_FLAG {
            CommandKind::Trap
        } else if self.opcode & CMD_ASYNC_FLAG != 0 {
            CommandKind::Async
        } else {
            CommandKind::Sync
        }
    }
    /// Total on-wire size of this record, header included.
    pub fn wire_len(&self) -> usize {
        CMD_HDR_LEN + self.payload.len()
    }
}
