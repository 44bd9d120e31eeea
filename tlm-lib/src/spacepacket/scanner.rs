use std::collections::HashSet;

use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{Apid, Packet, PrimaryHeader};
use crate::dataset::TelemetryDataset;
use crate::timecode;
use crate::Error;

/// CCSDS attached sync marker preceding each packet in frame-sync mode.
pub const SYNC_MARKER: [u8; 4] = [0x1a, 0xcf, 0xfc, 0x1d];

/// Configuration for a [Scanner].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScanConfig {
    /// Maximum number of packets accumulated into each batch.
    #[builder(default = 256)]
    pub batch_size: usize,

    /// Mission-specific secondary header length in bytes. Only applied to
    /// packets that flag a secondary header. Common values are 8 (CDS with
    /// microseconds) or 10 (CUC with fine time).
    #[builder(default)]
    pub sec_hdr_length: usize,

    /// When set, only packets with these APIDs are batched. Other packets
    /// are still decoded to advance the cursor correctly.
    #[builder(default, setter(strip_option))]
    pub apids: Option<Vec<Apid>>,

    /// When true, scan for a [SYNC_MARKER] before each packet.
    #[builder(default = false)]
    pub frame_sync: bool,

    /// When set, decode each packet's source time from the start of its
    /// secondary header.
    #[builder(default, setter(strip_option))]
    pub timecode: Option<timecode::Format>,

    /// Stamped onto every produced packet.
    #[builder(default, setter(strip_option, into))]
    pub source_id: Option<String>,

    /// Ground receipt time stamped onto every produced packet.
    #[builder(default, setter(strip_option))]
    pub receipt_time: Option<f64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig::builder().build()
    }
}

/// Scanner walks an in-memory byte buffer producing packets grouped into
/// [TelemetryDataset] batches of a configured maximum size.
///
/// In plain mode packets are parsed back-to-back from the current cursor; a
/// partial packet at the end of the buffer ends the scan cleanly. Headers
/// failing validation advance the cursor a single byte at a time. In
/// frame-sync mode the buffer is searched for a [SYNC_MARKER] before each
/// packet; a marker that never appears ends the scan with no packets.
pub struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
    config: ScanConfig,
    allow: Option<HashSet<Apid>>,
    done: bool,
}

impl<'a> Scanner<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], config: ScanConfig) -> Self {
        let allow = config.apids.as_ref().map(|v| v.iter().copied().collect());
        Scanner {
            buf,
            pos: 0,
            config,
            allow,
            done: false,
        }
    }

    /// Byte offset of the cursor into the buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn next_packet(&mut self) -> Option<Packet> {
        if self.config.frame_sync {
            self.next_marked_packet()
        } else {
            self.next_contiguous_packet()
        }
    }

    fn next_contiguous_packet(&mut self) -> Option<Packet> {
        loop {
            let rest = &self.buf[self.pos..];
            if rest.len() < PrimaryHeader::LEN {
                return None;
            }
            // header decode with >= 6 bytes cannot fail
            let header = PrimaryHeader::decode(rest).ok()?;
            if !valid_header(&header) {
                trace!(offset = self.pos, "invalid header, advancing one byte");
                self.pos += 1;
                continue;
            }
            match Packet::decode(rest, self.config.sec_hdr_length) {
                Ok((packet, used)) => {
                    self.pos += used;
                    return Some(self.stamp(packet));
                }
                // partial packet, treat as end of stream
                Err(Error::TruncatedPacket { .. }) => return None,
                Err(_) => return None,
            }
        }
    }

    fn next_marked_packet(&mut self) -> Option<Packet> {
        loop {
            let start = find_marker(&self.buf[self.pos..])?;
            self.pos += start + SYNC_MARKER.len();

            let rest = &self.buf[self.pos..];
            if rest.len() < PrimaryHeader::LEN {
                return None;
            }
            let header = PrimaryHeader::decode(rest).ok()?;
            if !valid_header(&header) {
                trace!(offset = self.pos, "invalid header after marker, rescanning");
                continue;
            }
            match Packet::decode(rest, self.config.sec_hdr_length) {
                Ok((packet, used)) => {
                    self.pos += used;
                    return Some(self.stamp(packet));
                }
                Err(_) => return None,
            }
        }
    }

    fn stamp(&self, mut packet: Packet) -> Packet {
        packet.source_id = self.config.source_id.clone();
        packet.receipt_time = self.config.receipt_time;
        if let Some(ref format) = self.config.timecode {
            if !packet.secondary_header.is_empty() {
                match timecode::decode_seconds(format, &packet.secondary_header) {
                    Ok(secs) => packet.source_time = Some(secs),
                    Err(err) => {
                        debug!(apid = packet.header.apid, %err, "failed to decode packet timecode");
                    }
                }
            }
        }
        packet
    }

    fn wanted(&self, apid: Apid) -> bool {
        self.allow.as_ref().map_or(true, |set| set.contains(&apid))
    }
}

/// Find the next [SYNC_MARKER], scanning byte-by-byte.
fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC_MARKER.len()).position(|w| w == SYNC_MARKER)
}

/// Headers with a non-zero version are not valid CCSDS space packets and are
/// treated as malformed during scanning.
fn valid_header(header: &PrimaryHeader) -> bool {
    header.version == 0
}

impl Iterator for Scanner<'_> {
    type Item = TelemetryDataset;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = TelemetryDataset::default();
        if let Some(ref id) = self.config.source_id {
            batch
                .metadata
                .insert("source".to_string(), serde_json::Value::from(id.clone()));
        }
        while batch.len() < self.config.batch_size {
            match self.next_packet() {
                Some(packet) => {
                    if !self.wanted(packet.header.apid) {
                        continue;
                    }
                    batch.add_packet(packet);
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if batch.is_empty() {
            // an empty trailing batch is never emitted
            None
        } else {
            Some(batch)
        }
    }
}

/// Scan `buf` for packets per `config`, producing batches of at most
/// `config.batch_size` packets.
///
/// # Example
/// ```
/// use tlm::spacepacket::{scan, ScanConfig};
///
/// let dat: &[u8] = &[
///     // primary header bytes
///     0xd, 0x59, 0xd2, 0xab, 0x0, 07,
///     // Cds timecode bytes in secondary header (not decoded here)
///     0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
///     // minimum 1 byte of user data
///     0xff
/// ];
/// let batches: Vec<_> = scan(dat, ScanConfig::default()).collect();
/// assert_eq!(batches.len(), 1);
/// assert_eq!(batches[0].packets[0].header.apid, 1369);
/// ```
pub fn scan(buf: &[u8], config: ScanConfig) -> Scanner {
    Scanner::new(buf, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_bytes(apid: Apid, seq: u16, user_data: &[u8]) -> Vec<u8> {
        let header = PrimaryHeader {
            version: 0,
            type_flag: 0,
            has_secondary_header: false,
            apid,
            sequence_flags: super::super::SEQ_UNSEGMENTED,
            sequence_id: seq,
            len_minus1: (user_data.len() - 1) as u16,
        };
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(user_data);
        buf
    }

    fn stream(count: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        for i in 0..count {
            buf.extend(packet_bytes(100, i as u16, &[0xab, 0xcd]));
        }
        buf
    }

    #[test]
    fn batches_cover_all_packets() {
        // 10 packets with batch size 4 -> batches of 4, 4, 2
        let buf = stream(10);
        let config = ScanConfig::builder().batch_size(4).build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();

        assert_eq!(batches.len(), 3);
        let counts: Vec<usize> = batches.iter().map(TelemetryDataset::len).collect();
        assert_eq!(counts, vec![4, 4, 2]);
        assert!(batches.iter().all(|b| !b.is_empty()));

        let seqs: Vec<u16> = batches
            .iter()
            .flat_map(|b| b.packets.iter().map(Packet::seq_count))
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u16>>());
    }

    #[test]
    fn empty_buffer_yields_no_batches() {
        let batches: Vec<TelemetryDataset> = scan(&[], ScanConfig::default()).collect();
        assert!(batches.is_empty());
    }

    #[test]
    fn partial_trailing_packet_ends_scan() {
        let mut buf = stream(2);
        // header declaring more data than remains
        buf.extend(&packet_bytes(100, 2, &[0u8; 8])[..10]);

        let batches: Vec<TelemetryDataset> = scan(&buf, ScanConfig::default()).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn invalid_header_skips_single_bytes() {
        let mut buf = vec![0xff; 3]; // version bits set, not a valid header
        buf.extend(stream(1));

        let batches: Vec<TelemetryDataset> = scan(&buf, ScanConfig::default()).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0].packets[0].header.apid, 100);
    }

    #[test]
    fn apid_allow_list_drops_but_advances() {
        let mut buf = Vec::new();
        buf.extend(packet_bytes(100, 0, &[1, 2]));
        buf.extend(packet_bytes(200, 0, &[3, 4]));
        buf.extend(packet_bytes(100, 1, &[5, 6]));

        let config = ScanConfig::builder().apids(vec![100]).build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].packets.iter().all(|p| p.header.apid == 100));
    }

    #[test]
    fn frame_sync_recovers_packets_between_garbage() {
        let mut buf = Vec::new();
        for i in 0..3u16 {
            buf.extend([0xde, 0xad, 0xbe]); // garbage before each marker
            buf.extend(SYNC_MARKER);
            buf.extend(packet_bytes(100, i, &[9, 9]));
        }

        let config = ScanConfig::builder().frame_sync(true).build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();

        assert_eq!(batches.len(), 1);
        let seqs: Vec<u16> = batches[0].packets.iter().map(Packet::seq_count).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn frame_sync_without_marker_yields_nothing() {
        // well-formed packets, but no markers present
        let buf = stream(4);
        let config = ScanConfig::builder().frame_sync(true).build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();
        assert!(batches.is_empty());
    }

    #[test]
    fn stamps_source_and_receipt() {
        let buf = stream(1);
        let config = ScanConfig::builder()
            .source_id("gs-1")
            .receipt_time(1234.5)
            .build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();

        let packet = &batches[0].packets[0];
        assert_eq!(packet.source_id.as_deref(), Some("gs-1"));
        assert_eq!(packet.receipt_time, Some(1234.5));
        assert_eq!(batches[0].metadata["source"], "gs-1");
    }

    #[test]
    fn decodes_source_time_from_secondary_header() {
        let header = PrimaryHeader {
            version: 0,
            type_flag: 0,
            has_secondary_header: true,
            apid: 1369,
            sequence_flags: super::super::SEQ_UNSEGMENTED,
            sequence_id: 1,
            len_minus1: 9, // 8 byte CDS timecode + 2 bytes user data - 1
        };
        let mut buf = header.encode().to_vec();
        buf.extend([0x5f, 0x5b, 0x00, 0x00, 0x06, 0x94, 0x02, 0x07]); // CDS(2, 2)
        buf.extend([0xaa, 0xbb]);

        let config = ScanConfig::builder()
            .sec_hdr_length(8)
            .timecode(timecode::Format::Cds {
                num_day: 2,
                num_submillis: 2,
            })
            .build();
        let batches: Vec<TelemetryDataset> = scan(&buf, config).collect();

        let packet = &batches[0].packets[0];
        let expected = timecode::decode_seconds(
            &timecode::Format::Cds {
                num_day: 2,
                num_submillis: 2,
            },
            &packet.secondary_header,
        )
        .unwrap();
        assert_eq!(packet.source_time, Some(expected));
        assert_eq!(packet.user_data, vec![0xaa, 0xbb]);
    }
}
