//! Response-stream demultiplexing.
//!
//! The firmware merges command responses and received frames into a single
//! byte stream per bulk transfer. Commands are introduced by the fixed
//! [RSP_MAGIC](crate::fwcmd::RSP_MAGIC) marker; everything outside a marked
//! cluster is frame data. The stream is not word-aligned, so the marker is
//! located with a sentinel scan plus a bounded look-behind, never by stepping
//! in header-sized units.

use crate::{
    fwcmd::{CommandRecord, RSP_MAGIC, RSP_MAGIC_FF_LEN, RSP_MAGIC_LEN, RSP_MAGIC_NON_FF_LEN},
    stats::Counters,
};

/// Clusters per buffer the hardware is known to produce.
///
/// The firmware merges at most the response to one command with one trap in
/// a single transfer; anything beyond that has never been observed and is
/// folded into the trailing data fragment.
const MAX_CLUSTERS: u8 = 2;

/// One demultiplexed piece of a response buffer, in original stream order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxSegment<'a> {
    /// A run of frame bytes, to be handed to MPDU reassembly.
    Data(&'a [u8]),
    /// A command record found behind a response marker.
    Command(CommandRecord<'a>),
}

/// Iterator over the segments of one response buffer.
///
/// Ordering is load-bearing: data fragments reflect real on-air timing and
/// must reach the reassembly stage in the order they were received.
pub struct ResponseStream<'a> {
    buffer: &'a [u8],
    counters: &'a Counters,
    /// Start of the data fragment currently being accumulated.
    fragment_start: usize,
    /// Sentinel probe position.
    probe: usize,
    clusters: u8,
    queued_command: Option<CommandRecord<'a>>,
    done: bool,
}
impl<'a> ResponseStream<'a> {
    pub fn new(buffer: &'a [u8], counters: &'a Counters) -> Self {
        Self {
            buffer,
            counters,
            fragment_start: 0,
            probe: 0,
            clusters: 0,
            queued_command: None,
            done: false,
        }
    }
    /// Check whether a response marker covers `probe`, which holds a `0xff`.
    ///
    /// The sentinel may sit at any of the marker's twelve trailing byte
    /// positions, so up to twelve alignments are probed backwards.
    fn marker_start_around(&self, probe: usize) -> Option<usize> {
        for look_behind in 0..RSP_MAGIC_FF_LEN {
            let Some(start) = probe.checked_sub(RSP_MAGIC_NON_FF_LEN + look_behind) else {
                break;
            };
            if start < self.fragment_start {
                break;
            }
            let Some(window) = self.buffer.get(start..start + RSP_MAGIC_LEN) else {
                continue;
            };
            if window == &RSP_MAGIC {
                return Some(start);
            }
        }
        None
    }
    /// Terminate the scan, emitting whatever is left as the final fragment.
    fn finish(&mut self) -> Option<RxSegment<'a>> {
        self.done = true;
        let fragment = &self.buffer[self.fragment_start..];
        if fragment.is_empty() {
            None
        } else {
            Some(RxSegment::Data(fragment))
        }
    }
}
impl<'a> Iterator for ResponseStream<'a> {
    type Item = RxSegment<'a>;

    fn next(&mut self) -> Option<RxSegment<'a>> {
        if let Some(record) = self.queued_command.take() {
            return Some(RxSegment::Command(record));
        }
        if self.done {
            return None;
        }
        while self.probe < self.buffer.len() {
            if self.buffer[self.probe] != 0xff {
                // Not inside a marker's 0xff run; the next candidate run is
                // at least one stride away.
                self.probe += RSP_MAGIC_FF_LEN;
                continue;
            }
            let Some(marker_start) = self.marker_start_around(self.probe) else {
                self.probe += RSP_MAGIC_FF_LEN;
                continue;
            };
            if self.clusters == MAX_CLUSTERS {
                // Third cluster in one transfer: unexpected, carried along
                // as data so nothing is lost downstream.
                warn!(
                    "more than {} command clusters in one response, folding into data",
                    MAX_CLUSTERS
                );
                return self.finish();
            }
            let record_start = marker_start + RSP_MAGIC_LEN;
            let Some((record, consumed)) = CommandRecord::parse(&self.buffer[record_start..])
            else {
                error!("command record declares a size that runs out of the buffer");
                Counters::bump(&self.counters.err_counter);
                // The declared length cannot be trusted, so the rest of the
                // buffer is dropped.
                let fragment = &self.buffer[self.fragment_start..marker_start];
                self.done = true;
                return (!fragment.is_empty()).then_some(RxSegment::Data(fragment));
            };
            self.clusters += 1;
            let fragment = &self.buffer[self.fragment_start..marker_start];
            self.fragment_start = record_start + consumed;
            self.probe = self.fragment_start;
            if fragment.is_empty() {
                return Some(RxSegment::Command(record));
            }
            self.queued_command = Some(record);
            return Some(RxSegment::Data(fragment));
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fwcmd::{RSP_ATIM, RSP_TXCOMP};

    fn record_bytes(opcode: u8, seq: u8, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut bytes = std::vec![payload.len() as u8, opcode, seq, 0x00];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn cluster(opcode: u8, seq: u8, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut bytes = RSP_MAGIC.to_vec();
        bytes.extend_from_slice(&record_bytes(opcode, seq, payload));
        bytes
    }

    fn segments<'a>(buffer: &'a [u8], counters: &'a Counters) -> std::vec::Vec<RxSegment<'a>> {
        ResponseStream::new(buffer, counters).collect()
    }

    #[test]
    fn plain_data_passes_through_whole() {
        let counters = Counters::new();
        let buffer = [0x42u8; 96];
        assert_eq!(
            segments(&buffer, &counters),
            std::vec![RxSegment::Data(&buffer[..])]
        );
    }

    #[test]
    fn data_with_ff_runs_is_not_mistaken_for_commands() {
        let counters = Counters::new();
        let buffer = [0xffu8; 64];
        assert_eq!(
            segments(&buffer, &counters),
            std::vec![RxSegment::Data(&buffer[..])]
        );
    }

    #[test]
    fn single_cluster_with_surrounding_data() {
        // 20 bytes of frame data, a marked record with a 4 byte payload and
        // 6 trailing frame bytes.
        let counters = Counters::new();
        let mut buffer = std::vec![0x20u8; 20];
        buffer.extend_from_slice(&cluster(RSP_TXCOMP, 3, &[1, 2, 3, 4]));
        buffer.extend_from_slice(&[0x60; 6]);

        let got = segments(&buffer, &counters);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], RxSegment::Data(&buffer[..20]));
        let RxSegment::Command(record) = got[1] else {
            panic!("expected a command record");
        };
        assert_eq!(record.opcode, RSP_TXCOMP);
        assert_eq!(record.sequence, 3);
        assert_eq!(record.payload, &[1, 2, 3, 4]);
        assert_eq!(got[2], RxSegment::Data(&buffer[buffer.len() - 6..]));
    }

    #[test]
    fn cluster_at_buffer_start() {
        let counters = Counters::new();
        let buffer = cluster(RSP_ATIM, 0, &[]);
        let got = segments(&buffer, &counters);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], RxSegment::Command(r) if r.opcode == RSP_ATIM));
    }

    #[test]
    fn marker_found_at_every_alignment() {
        // The sentinel scan strides in 12 byte steps, so the marker must be
        // found no matter where it sits relative to the stride grid.
        let counters = Counters::new();
        for offset in 0..32usize {
            let mut buffer = std::vec![0x11u8; offset];
            buffer.extend_from_slice(&cluster(RSP_TXCOMP, 0, &[0xaa]));
            let got = segments(&buffer, &counters);
            let expected_len = if offset == 0 { 1 } else { 2 };
            assert_eq!(got.len(), expected_len, "offset {offset}");
            assert!(
                matches!(got[expected_len - 1], RxSegment::Command(_)),
                "offset {offset}"
            );
        }
    }

    #[test]
    fn two_adjacent_clusters_are_supported() {
        let counters = Counters::new();
        let mut buffer = std::vec![0x01u8; 8];
        buffer.extend_from_slice(&cluster(RSP_TXCOMP, 4, &[0xaa, 0xbb]));
        buffer.extend_from_slice(&cluster(RSP_ATIM, 5, &[]));
        buffer.extend_from_slice(&[0x02; 5]);

        let got = segments(&buffer, &counters);
        assert_eq!(got.len(), 4);
        assert!(matches!(got[0], RxSegment::Data(d) if d.len() == 8));
        assert!(matches!(got[1], RxSegment::Command(r) if r.sequence == 4));
        assert!(matches!(got[2], RxSegment::Command(r) if r.sequence == 5));
        assert!(matches!(got[3], RxSegment::Data(d) if d.len() == 5));
    }

    #[test]
    fn third_cluster_folds_into_trailing_data() {
        let counters = Counters::new();
        let mut buffer = cluster(RSP_TXCOMP, 0, &[]);
        buffer.extend_from_slice(&cluster(RSP_TXCOMP, 1, &[]));
        let third = cluster(RSP_TXCOMP, 2, &[]);
        buffer.extend_from_slice(&third);

        let got = segments(&buffer, &counters);
        assert_eq!(got.len(), 3);
        assert!(matches!(got[0], RxSegment::Command(_)));
        assert!(matches!(got[1], RxSegment::Command(_)));
        // The whole third cluster, marker included, is passed through as data.
        assert_eq!(got[2], RxSegment::Data(&third[..]));
        assert_eq!(Counters::get(&counters.err_counter), 0);
    }

    #[test]
    fn oversized_record_drops_the_remainder() {
        let counters = Counters::new();
        let mut buffer = std::vec![0x07u8; 10];
        buffer.extend_from_slice(&RSP_MAGIC);
        // Declared payload of 200 bytes, but only 4 follow.
        buffer.extend_from_slice(&[200, RSP_TXCOMP, 0, 0]);
        buffer.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let got = segments(&buffer, &counters);
        assert_eq!(got, std::vec![RxSegment::Data(&buffer[..10])]);
        assert_eq!(Counters::get(&counters.err_counter), 1);
    }

    #[test]
    fn clipped_header_drops_the_remainder() {
        let counters = Counters::new();
        let mut buffer = std::vec![];
        buffer.extend_from_slice(&RSP_MAGIC);
        buffer.extend_from_slice(&[0x04, RSP_TXCOMP]);

        assert_eq!(segments(&buffer, &counters), std::vec![]);
        assert_eq!(Counters::get(&counters.err_counter), 1);
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let counters = Counters::new();
        assert_eq!(segments(&[], &counters), std::vec![]);
    }
}
