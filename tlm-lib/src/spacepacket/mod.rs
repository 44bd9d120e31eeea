//! CCSDS Space Packet decoding.
//!
//! Reference: CCSDS 133.0-B-2 (Space Packet Protocol)
mod scanner;

use std::fmt::Display;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use scanner::{scan, ScanConfig, Scanner, SYNC_MARKER};

pub type Apid = u16;

/// Packet is the first packet in a packet group
pub const SEQ_FIRST: u8 = 1;
/// Packet is a part of a packet group, but not first and not last
pub const SEQ_CONTINUATION: u8 = 0;
/// Packet is the last packet in a packet group
pub const SEQ_LAST: u8 = 2;
/// Packet is not part of a packet group, i.e., standalone.
pub const SEQ_UNSEGMENTED: u8 = 3;

/// CCSDS Primary Header
///
/// The 6-byte primary header format common to all CCSDS space packets.
///
/// Bit layout (48 bits total):
/// ```text
/// [3]  version    [1] type_flag  [1] has_secondary_header  [11] apid
/// [2]  sequence_flags  [14] sequence_id
/// [16] len_minus1
/// ```
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    /// Defines a packets grouping. See the `SEQ_*` values.
    pub sequence_flags: u8,
    pub sequence_id: u16,
    /// Length of the packet data field, less 1; see [`Self::packet_data_length`].
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    pub const SEQ_MAX: u16 = 16383;

    /// Decode from bytes.
    ///
    /// # Errors
    /// [Error::MalformedHeader] if there are not enough bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::MalformedHeader(format!(
                "need {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Ok(PrimaryHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Encode to bytes; the byte-exact inverse of [`Self::decode`].
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let d1 = (u16::from(self.version) << 13)
            | (u16::from(self.type_flag) << 12)
            | (u16::from(self.has_secondary_header) << 11)
            | (self.apid & 0x7ff);
        let d2 = (u16::from(self.sequence_flags) << 14) | (self.sequence_id & 0x3fff);
        let d1 = d1.to_be_bytes();
        let d2 = d2.to_be_bytes();
        let d3 = self.len_minus1.to_be_bytes();
        [d1[0], d1[1], d2[0], d2[1], d3[0], d3[1]]
    }

    /// Read header from `r`.
    ///
    /// # Errors
    /// Any ``std::io::Error`` reading
    pub fn read<R>(mut r: R) -> Result<PrimaryHeader>
    where
        R: Read,
    {
        let mut buf = [0u8; Self::LEN];
        r.read_exact(&mut buf)?;

        Self::decode(&buf)
    }

    /// Actual length of the packet data field in bytes.
    #[must_use]
    pub fn packet_data_length(&self) -> usize {
        self.len_minus1 as usize + 1
    }

    /// Total packet length in bytes, header included.
    #[must_use]
    pub fn total_length(&self) -> usize {
        Self::LEN + self.packet_data_length()
    }
}

/// A single CCSDS space packet and its associated data.
///
/// The packet data field is kept split into the mission-specific secondary
/// header bytes and the remaining user data. The split point is not encoded
/// in the packet itself and must be supplied by the caller when decoding; see
/// [`Packet::decode`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Packet {
    /// All packets have a primary header
    pub header: PrimaryHeader,
    /// Mission-specific secondary header bytes; empty when not split out.
    #[serde(with = "serde_bytes")]
    pub secondary_header: Vec<u8>,
    /// Packet user data
    #[serde(with = "serde_bytes")]
    pub user_data: Vec<u8>,
    /// Packet time decoded from the secondary header, as continuous TAI
    /// seconds. `None` when no timecode was decoded.
    pub source_time: Option<f64>,
    /// Ground receipt time (UNIX epoch seconds).
    pub receipt_time: Option<f64>,
    /// Originating spacecraft or ground station identifier.
    pub source_id: Option<String>,
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{header: {:?}, data:[len={}]}}",
            self.header,
            self.secondary_header.len() + self.user_data.len()
        )?;
        Ok(())
    }
}

impl Packet {
    /// Create a packet, validating the data field against the header.
    ///
    /// # Errors
    /// [Error::LengthMismatch] if the secondary header and user data together
    /// do not contain exactly the number of bytes the header declares.
    pub fn new(header: PrimaryHeader, secondary_header: Vec<u8>, user_data: Vec<u8>) -> Result<Self> {
        let actual = secondary_header.len() + user_data.len();
        if actual != header.packet_data_length() {
            return Err(Error::LengthMismatch {
                expected: header.packet_data_length(),
                actual,
            });
        }
        Ok(Packet {
            header,
            secondary_header,
            user_data,
            source_time: None,
            receipt_time: None,
            source_id: None,
        })
    }

    /// Decode a single packet from the start of `dat`, returning the packet
    /// and the number of bytes consumed.
    ///
    /// If the header flags a secondary header and `sec_hdr_len` is non-zero
    /// the first `sec_hdr_len` bytes of the data field become the secondary
    /// header, otherwise the whole data field is user data. The split length
    /// is mission-specific and is never inferred from the flag alone.
    ///
    /// # Errors
    /// [Error::MalformedHeader] if there are not enough bytes for a header,
    /// [Error::TruncatedPacket] if there are fewer bytes than the header
    /// declares.
    pub fn decode(dat: &[u8], sec_hdr_len: usize) -> Result<(Packet, usize)> {
        let header = PrimaryHeader::decode(dat)?;
        let total = header.total_length();
        if dat.len() < total {
            return Err(Error::TruncatedPacket {
                declared: header.packet_data_length(),
                available: dat.len().saturating_sub(PrimaryHeader::LEN),
            });
        }
        let data_field = &dat[PrimaryHeader::LEN..total];
        let split = if header.has_secondary_header && sec_hdr_len > 0 {
            sec_hdr_len.min(data_field.len())
        } else {
            0
        };
        let packet = Packet {
            header,
            secondary_header: data_field[..split].to_vec(),
            user_data: data_field[split..].to_vec(),
            source_time: None,
            receipt_time: None,
            source_id: None,
        };
        Ok((packet, total))
    }

    /// Read a single [Packet], without splitting out a secondary header.
    ///
    /// # Errors
    /// Any ``std::io::Error`` reading
    pub fn read<R>(mut r: R) -> std::io::Result<Packet>
    where
        R: Read,
    {
        let mut buf = [0u8; PrimaryHeader::LEN];
        r.read_exact(&mut buf)?;
        // cannot fail, we just read exactly enough bytes
        let header = PrimaryHeader::decode(&buf).expect("header from full buffer");
        let mut data = vec![0u8; header.packet_data_length()];
        r.read_exact(&mut data)?;

        Ok(Packet {
            header,
            secondary_header: Vec::new(),
            user_data: data,
            source_time: None,
            receipt_time: None,
            source_id: None,
        })
    }

    #[must_use]
    pub fn apid(&self) -> Apid {
        self.header.apid
    }

    #[must_use]
    pub fn seq_count(&self) -> u16 {
        self.header.sequence_id
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.header.sequence_flags == SEQ_FIRST
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.header.sequence_flags == SEQ_LAST
    }

    #[must_use]
    pub fn is_cont(&self) -> bool {
        self.header.sequence_flags == SEQ_CONTINUATION
    }

    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.header.sequence_flags == SEQ_UNSEGMENTED
    }
}

/// Calculate the number of missing sequence ids.
///
/// `cur` is the current sequence id. `last` is the sequence id seen before `cur`.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let expected = if last + 1 > PrimaryHeader::SEQ_MAX {
        0
    } else {
        last + 1
    };
    if cur != expected {
        if last + 1 > cur {
            return cur + PrimaryHeader::SEQ_MAX - last;
        }
        return cur - last - 1;
    }
    0
}

pub struct PacketReaderIter<R>
where
    R: Read,
{
    reader: R,
}

impl<R> Iterator for PacketReaderIter<R>
where
    R: Read,
{
    type Item = std::io::Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        match Packet::read(&mut self.reader) {
            Ok(p) => Some(Ok(p)),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    return None;
                }
                Some(Err(err))
            }
        }
    }
}

/// Return an iterator providing [Packet] data read from a byte synchronized
/// packet stream.
///
/// The iterator ends at EOF or on the first partial packet.
pub fn decode_packets<R>(reader: R) -> impl Iterator<Item = std::io::Result<Packet>>
where
    R: Read,
{
    PacketReaderIter { reader }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_decode_header() {
        let dat: [u8; 6] = [
            // bytes from a SNPP CrIS packet
            0xd, 0x59, 0xd2, 0xab, 0xa, 0x8f,
        ];
        let ph = PrimaryHeader::decode(&dat).unwrap();

        assert_eq!(ph.version, 0);
        assert_eq!(ph.type_flag, 0);
        assert!(ph.has_secondary_header);
        assert_eq!(ph.apid, 1369);
        assert_eq!(ph.sequence_flags, 3);
        assert_eq!(ph.sequence_id, 4779);
        assert_eq!(ph.len_minus1, 2703);
    }

    #[test]
    fn test_decode_header_too_short() {
        let dat: [u8; 5] = [0xd, 0x59, 0xd2, 0xab, 0xa];
        assert!(matches!(
            PrimaryHeader::decode(&dat),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test_case(0, 0, false, 0, SEQ_CONTINUATION, 0, 0; "all zero")]
    #[test_case(0, 0, true, 1369, SEQ_UNSEGMENTED, 4779, 2703; "cris")]
    #[test_case(7, 1, true, 2047, SEQ_UNSEGMENTED, PrimaryHeader::SEQ_MAX, u16::MAX; "all max")]
    #[test_case(3, 1, false, 1, SEQ_FIRST, 1, 7; "first segment")]
    #[test_case(0, 0, false, 100, SEQ_LAST, 16000, 255; "last segment")]
    fn test_header_roundtrip(
        version: u8,
        type_flag: u8,
        has_secondary_header: bool,
        apid: Apid,
        sequence_flags: u8,
        sequence_id: u16,
        len_minus1: u16,
    ) {
        let header = PrimaryHeader {
            version,
            type_flag,
            has_secondary_header,
            apid,
            sequence_flags,
            sequence_id,
            len_minus1,
        };
        let decoded = PrimaryHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_encode_matches_wire_bytes() {
        let dat: [u8; 6] = [0xd, 0x59, 0xd2, 0xab, 0xa, 0x8f];
        let ph = PrimaryHeader::decode(&dat).unwrap();
        assert_eq!(ph.encode(), dat);
    }

    #[test]
    fn test_decode_packet_splits_secondary_header() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            // header declaring a secondary header and 10 data bytes
            0xd, 0x59, 0xd2, 0xab, 0x0, 0x9,
            0x1, 0x2, 0x3, 0x4, 0x5, 0x6, 0x7, 0x8, 0xaa, 0xbb,
        ];
        let (packet, used) = Packet::decode(dat, 8).unwrap();
        assert_eq!(used, 16);
        assert_eq!(packet.secondary_header, &dat[6..14]);
        assert_eq!(packet.user_data, &[0xaa, 0xbb]);
    }

    #[test]
    fn test_decode_packet_without_split() {
        let dat: &[u8] = &[0xd, 0x59, 0xd2, 0xab, 0x0, 0x1, 0xaa, 0xbb];
        let (packet, used) = Packet::decode(dat, 0).unwrap();
        assert_eq!(used, 8);
        assert!(packet.secondary_header.is_empty());
        assert_eq!(packet.user_data, &[0xaa, 0xbb]);
    }

    #[test]
    fn test_decode_packet_truncated() {
        // header declares 2704 data bytes but only 1 follows
        let dat: &[u8] = &[0xd, 0x59, 0xd2, 0xab, 0xa, 0x8f, 0xff];
        assert!(matches!(
            Packet::decode(dat, 0),
            Err(Error::TruncatedPacket { declared: 2704, .. })
        ));
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let header = PrimaryHeader::decode(&[0xd, 0x59, 0xd2, 0xab, 0x0, 0x1]).unwrap();
        let zult = Packet::new(header, Vec::new(), vec![0xff]);
        assert!(matches!(
            zult,
            Err(Error::LengthMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn packet_iter_test() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            // Primary/secondary header and a single byte of user data
            // byte 4 is sequence number 1 & 2
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
            0xd, 0x59, 0xc0, 0x02, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
        ];
        let reader = std::io::BufReader::new(dat);

        let packets: Vec<Packet> = decode_packets(reader)
            .filter_map(std::result::Result::ok)
            .collect();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.apid, 1369);
        assert_eq!(packets[0].header.sequence_id, 1);
        assert_eq!(&packets[0].user_data[..], &dat[6..15]);
        assert_eq!(packets[1].header.sequence_id, 2);
    }

    #[test]
    fn test_missing_packets() {
        assert_eq!(missing_packets(5, 4), 0);
        assert_eq!(missing_packets(5, 3), 1);
        assert_eq!(missing_packets(0, PrimaryHeader::SEQ_MAX), 0);
        assert_eq!(missing_packets(0, PrimaryHeader::SEQ_MAX - 1), 1);
        assert_eq!(missing_packets(0, 0), PrimaryHeader::SEQ_MAX);
    }
}
