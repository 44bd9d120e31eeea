//! Time code parsing.
//!
//! Reference: [CCSDS Time Code Formats](https://public.ccsds.org/Pubs/301x0b4e1.pdf)
use hifitime::{Duration, Epoch};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of seconds between the CCSDS epoch (1958) and the hifitime
/// reference epoch (1900).
const CCSDS_HIFIEPOCH_DELTA_SECS: u64 = 1_830_297_600;
/// Number of bytes for the CDS milliseconds-of-day field
const NUM_CDS_MILLIS_BYTES: usize = 4;
/// Max number of u64 nanoseconds that can be cast to f64 w/o precision loss
const MAX_FINE_NANOS: f64 = 4_503_599_627_370_496.0;

/// CCSDS timecode format configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
#[non_exhaustive]
pub enum Format {
    /// Day segmented timecode parameters.
    ///
    /// `num_day` must be 2 or 3 and `num_submillis` 0 (no sub-milliseconds),
    /// 2 (microseconds), or 4 (picoseconds).
    Cds { num_day: usize, num_submillis: usize },
    /// Unsegmented timecode parameters.
    ///
    /// Valid `num_coarse` is between 1 and 4.
    /// Valid `num_fine` is between 0 and 3.
    Cuc {
        num_coarse: usize,
        num_fine: usize,
        /// Factor by which to multiply `num_fine` to produce nanoseconds.
        fine_mult: Option<f64>,
    },
}

impl Format {
    /// Number of bytes a timecode in this format occupies.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Format::Cds {
                num_day,
                num_submillis,
            } => num_day + NUM_CDS_MILLIS_BYTES + num_submillis,
            Format::Cuc {
                num_coarse,
                num_fine,
                ..
            } => num_coarse + num_fine,
        }
    }
}

/// Big-endian unsigned integer from up to 8 bytes.
fn be_uint(buf: &[u8]) -> u64 {
    buf.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

/// Decode `buf` into a [hifitime::Epoch].
///
/// # Errors
/// [Error::NotEnoughData] if there is not enough data for the provided
/// format, or [Error::TimecodeConfig] if the format fields are not a
/// supported combination.
pub fn decode(format: &Format, buf: &[u8]) -> Result<Epoch> {
    match format {
        Format::Cds {
            num_day,
            num_submillis,
        } => decode_cds(*num_day, *num_submillis, buf),
        Format::Cuc {
            num_coarse,
            num_fine,
            fine_mult,
        } => decode_cuc(*num_coarse, *num_fine, *fine_mult, buf),
    }
}

/// Decode `buf` into continuous TAI seconds.
///
/// This is the timeline used for parameter sample times.
///
/// # Errors
/// See [decode].
pub fn decode_seconds(format: &Format, buf: &[u8]) -> Result<f64> {
    Ok(decode(format, buf)?.to_tai_seconds())
}

fn decode_cds(num_day: usize, num_submillis: usize, buf: &[u8]) -> Result<Epoch> {
    if !matches!(num_day, 2 | 3) {
        return Err(Error::TimecodeConfig(format!(
            "Number of CDS day bytes must be 2 or 3; got {num_day}"
        )));
    }
    let want = num_day + NUM_CDS_MILLIS_BYTES + num_submillis;
    if buf.len() < want {
        return Err(Error::NotEnoughData {
            actual: buf.len(),
            minimum: want,
        });
    }

    let days = be_uint(&buf[..num_day]);
    let millis = be_uint(&buf[num_day..num_day + NUM_CDS_MILLIS_BYTES]);
    let submillis = be_uint(&buf[num_day + NUM_CDS_MILLIS_BYTES..want]);
    let nanos = match num_submillis {
        0 => 0,
        2 => submillis * 1_000,
        4 => submillis * 1_000_000,
        _ => {
            return Err(Error::TimecodeConfig(format!(
                "Number of CDS sub-millisecond bytes must be 0, 2, or 4; got {num_submillis}"
            )))
        }
    };

    let dur = Duration::compose(
        0,
        days,
        0,
        0,
        // Add in delta to get to hifi epoch
        CCSDS_HIFIEPOCH_DELTA_SECS,
        millis,
        0,
        nanos,
    );
    Ok(Epoch::from_utc_duration(dur))
}

fn decode_cuc(
    num_coarse: usize,
    num_fine: usize,
    fine_mult: Option<f64>,
    buf: &[u8],
) -> Result<Epoch> {
    if !(1..=4).contains(&num_coarse) {
        return Err(Error::TimecodeConfig(
            "Number of CUC coarse bytes must be 1 to 4".to_string(),
        ));
    }
    if !(0..=3).contains(&num_fine) {
        return Err(Error::TimecodeConfig(
            "Number of CUC fine bytes must be 0 to 3".to_string(),
        ));
    }
    if buf.len() < num_coarse + num_fine {
        return Err(Error::NotEnoughData {
            actual: buf.len(),
            minimum: num_coarse + num_fine,
        });
    }

    let coarse = be_uint(&buf[..num_coarse]) + CCSDS_HIFIEPOCH_DELTA_SECS;
    let fine = be_uint(&buf[num_coarse..num_coarse + num_fine]) as f64;
    let fine_nanos = (fine * fine_mult.unwrap_or(1.0)).trunc();
    if fine_nanos > MAX_FINE_NANOS {
        return Err(Error::TimecodeConfig(format!(
            "CUC fine value overflows nanoseconds: {fine_nanos}"
        )));
    }

    let dur = Duration::compose(0, 0, 0, 0, coarse, 0, 0, fine_nanos as u64);
    Ok(Epoch::from_tai_duration(dur))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn cds() {
        let buf = vec![0x5f, 0x5b, 0x00, 0x00, 0x06, 0x94, 0x02, 0x07];
        let cds = decode_cds(2, 2, &buf).unwrap();

        let expected = Epoch::from_str("2024-11-01T00:00:01.684519Z").unwrap();

        assert_eq!(cds, expected, "timecode={cds:?}");
    }

    #[test]
    fn cds_without_submillis() {
        let with = decode_cds(2, 2, &[0x5f, 0x5b, 0x00, 0x00, 0x06, 0x94, 0x00, 0x00]).unwrap();
        let without = decode_cds(2, 0, &[0x5f, 0x5b, 0x00, 0x00, 0x06, 0x94]).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn cds_short_buffer() {
        let zult = decode_cds(2, 2, &[0x5f, 0x5b, 0x00]);
        assert!(matches!(
            zult,
            Err(Error::NotEnoughData {
                actual: 3,
                minimum: 8
            })
        ));
    }

    #[test]
    fn cuc_coarse_seconds() {
        let a = decode_cuc(4, 0, None, &[0x7d, 0xb5, 0xbf, 0x2f]).unwrap();
        let b = decode_cuc(4, 0, None, &[0x7d, 0xb5, 0xbf, 0x30]).unwrap();
        assert_eq!(b - a, Duration::from_seconds(1.0));
    }

    #[test]
    fn cuc_fine_mult() {
        // NASA EOS Spacecraft (BGAD) data
        let buf = vec![0x7d, 0xb5, 0xbf, 0x2f, 0x80, 0x1f];
        let cuc = decode_cuc(4, 2, Some(15200.0), &buf).unwrap();

        let expected = Epoch::from_str("2024-10-31T10:49:19.498544800 TAI").unwrap();

        assert_eq!(cuc, expected);
    }

    #[test]
    fn cuc_bad_config() {
        assert!(decode_cuc(5, 0, None, &[0u8; 8]).is_err());
        assert!(decode_cuc(4, 4, None, &[0u8; 8]).is_err());
    }

    #[test]
    fn format_size() {
        let cds = Format::Cds {
            num_day: 2,
            num_submillis: 2,
        };
        assert_eq!(cds.size(), 8);
        let cuc = Format::Cuc {
            num_coarse: 4,
            num_fine: 2,
            fine_mult: None,
        };
        assert_eq!(cuc.size(), 6);
    }
}
