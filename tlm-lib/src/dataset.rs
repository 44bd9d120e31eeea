//! In-memory containers passed between pipeline stages.

use std::collections::HashMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::spacepacket::{Apid, Packet};

/// A raw (pre-calibration) value decoded from packet bytes.
///
/// The set of kinds is closed; it is fixed by the wire format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RawValue {
    Unsigned(u64),
    Signed(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
    Opaque(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl RawValue {
    /// Numeric coercion used by calibration. Booleans map to 0/1, text is
    /// parsed when it holds a number, opaque binary is never numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Unsigned(v) => Some(*v as f64),
            RawValue::Signed(v) => Some(*v as f64),
            RawValue::Double(v) => Some(*v),
            RawValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            RawValue::Text(s) => s.trim().parse().ok(),
            RawValue::Opaque(_) => None,
        }
    }
}

impl Display for RawValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawValue::Unsigned(v) => write!(f, "{v}"),
            RawValue::Signed(v) => write!(f, "{v}"),
            RawValue::Double(v) => write!(f, "{v}"),
            RawValue::Boolean(v) => write!(f, "{v}"),
            RawValue::Text(s) => write!(f, "{s}"),
            RawValue::Opaque(b) => write!(f, "{}", hex::encode(b)),
        }
    }
}

/// An engineering-unit value; numeric or string once calibration has run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum EngValue {
    Unsigned(u64),
    Signed(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
}

impl From<&RawValue> for EngValue {
    /// The uncalibrated engineering value: equal to the raw value, except
    /// opaque binary which is hex-encoded.
    fn from(raw: &RawValue) -> Self {
        match raw {
            RawValue::Unsigned(v) => EngValue::Unsigned(*v),
            RawValue::Signed(v) => EngValue::Signed(*v),
            RawValue::Double(v) => EngValue::Double(*v),
            RawValue::Boolean(v) => EngValue::Boolean(*v),
            RawValue::Text(s) => EngValue::Text(s.clone()),
            RawValue::Opaque(b) => EngValue::Text(hex::encode(b)),
        }
    }
}

impl Display for EngValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngValue::Unsigned(v) => write!(f, "{v}"),
            EngValue::Signed(v) => write!(f, "{v}"),
            EngValue::Double(v) => write!(f, "{v}"),
            EngValue::Boolean(v) => write!(f, "{v}"),
            EngValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A single decoded parameter sample.
///
/// Samples are value types; calibration produces a new sample rather than
/// mutating one in place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineeringParameter {
    pub name: String,
    pub apid: Apid,
    pub seq_count: u16,
    /// Continuous seconds on a monotonic timeline. When decoded from a
    /// packet without a source time this is the sequence count and is
    /// ordering-only, not wall/TAI time.
    pub sample_time: f64,
    pub raw_value: RawValue,
    pub eng_value: EngValue,
    pub unit: Option<String>,
    pub validity: bool,
    pub out_of_limit: bool,
    /// Alarm level 0 (nominal) through 3.
    pub alarm_level: u8,
    /// Audit tag naming the calibration method applied, if any.
    pub calibration_id: Option<String>,
}

/// A named sequence of [EngineeringParameter] samples within one batch.
///
/// Samples are kept in insertion order, which need not be time order;
/// consumers re-sort when required. See [`Self::samples_by_time`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ParameterRecord {
    pub name: String,
    pub unit: Option<String>,
    pub samples: Vec<EngineeringParameter>,
}

impl ParameterRecord {
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Min and max sample time, or `None` for an empty record.
    #[must_use]
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let first = self.samples.first()?.sample_time;
        Some(self.samples.iter().fold((first, first), |(lo, hi), s| {
            (lo.min(s.sample_time), hi.max(s.sample_time))
        }))
    }

    /// Samples sorted ascending on sample time.
    #[must_use]
    pub fn samples_by_time(&self) -> Vec<&EngineeringParameter> {
        let mut samples: Vec<&EngineeringParameter> = self.samples.iter().collect();
        samples.sort_by(|a, b| a.sample_time.total_cmp(&b.sample_time));
        samples
    }
}

/// Container for a batch of telemetry flowing through the pipeline.
///
/// A dataset is exclusively owned by whichever stage currently holds it;
/// ownership transfers stage to stage.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TelemetryDataset {
    pub packets: Vec<Packet>,
    pub parameters: HashMap<String, ParameterRecord>,
    pub metadata: HashMap<String, Value>,
}

impl TelemetryDataset {
    pub fn add_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn packets_by_apid(&self, apid: Apid) -> impl Iterator<Item = &Packet> {
        self.packets.iter().filter(move |p| p.header.apid == apid)
    }

    /// Append a sample, lazily creating its [ParameterRecord] on first use.
    pub fn add_parameter(&mut self, param: EngineeringParameter) {
        let record = self
            .parameters
            .entry(param.name.clone())
            .or_insert_with(|| ParameterRecord {
                name: param.name.clone(),
                unit: param.unit.clone(),
                samples: Vec::new(),
            });
        record.samples.push(param);
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterRecord> {
        self.parameters.get(name)
    }

    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    /// Total number of samples across all records.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.parameters.values().map(ParameterRecord::count).sum()
    }

    /// Number of packets in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Non-destructively merge `other` into this dataset.
    ///
    /// Packets are concatenated, overlapping parameter records accumulate
    /// samples, and `other`'s metadata wins on key collisions. Merging is
    /// associative on sample accumulation.
    #[must_use]
    pub fn merge(mut self, other: TelemetryDataset) -> TelemetryDataset {
        self.packets.extend(other.packets);
        self.metadata.extend(other.metadata);
        for (name, record) in other.parameters {
            match self.parameters.get_mut(&name) {
                Some(existing) => existing.samples.extend(record.samples),
                None => {
                    self.parameters.insert(name, record);
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, time: f64, raw: RawValue) -> EngineeringParameter {
        EngineeringParameter {
            name: name.to_string(),
            apid: 100,
            seq_count: 0,
            sample_time: time,
            eng_value: EngValue::from(&raw),
            raw_value: raw,
            unit: None,
            validity: true,
            out_of_limit: false,
            alarm_level: 0,
            calibration_id: None,
        }
    }

    #[test]
    fn raw_value_coercion() {
        assert_eq!(RawValue::Unsigned(2).as_f64(), Some(2.0));
        assert_eq!(RawValue::Signed(-2).as_f64(), Some(-2.0));
        assert_eq!(RawValue::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(RawValue::Text("3.5".to_string()).as_f64(), Some(3.5));
        assert_eq!(RawValue::Text("temp".to_string()).as_f64(), None);
        assert_eq!(RawValue::Opaque(vec![1, 2]).as_f64(), None);
    }

    #[test]
    fn opaque_eng_value_is_hex() {
        let eng = EngValue::from(&RawValue::Opaque(vec![0xde, 0xad]));
        assert_eq!(eng, EngValue::Text("dead".to_string()));
    }

    #[test]
    fn add_parameter_creates_record_lazily() {
        let mut ds = TelemetryDataset::default();
        assert!(ds.parameter("volts").is_none());

        ds.add_parameter(sample("volts", 1.0, RawValue::Unsigned(12)));
        ds.add_parameter(sample("volts", 0.0, RawValue::Unsigned(11)));

        let record = ds.parameter("volts").unwrap();
        assert_eq!(record.count(), 2);
        assert_eq!(record.time_range(), Some((0.0, 1.0)));

        // insertion order preserved, re-sorted on demand
        assert_eq!(record.samples[0].sample_time, 1.0);
        let sorted = record.samples_by_time();
        assert_eq!(sorted[0].sample_time, 0.0);
    }

    #[test]
    fn merge_accumulates_samples() {
        let mut a = TelemetryDataset::default();
        a.add_parameter(sample("volts", 0.0, RawValue::Unsigned(1)));
        a.add_parameter(sample("amps", 0.0, RawValue::Unsigned(2)));

        let mut b = TelemetryDataset::default();
        b.add_parameter(sample("volts", 1.0, RawValue::Unsigned(3)));
        b.add_parameter(sample("temp", 1.0, RawValue::Unsigned(4)));

        let merged = a.merge(b);
        assert_eq!(merged.parameter("volts").unwrap().count(), 2);
        assert_eq!(merged.parameter("amps").unwrap().count(), 1);
        assert_eq!(merged.parameter("temp").unwrap().count(), 1);
        assert_eq!(merged.sample_count(), 4);
    }

    #[test]
    fn merge_is_associative() {
        let mk = |name: &str, time: f64| {
            let mut ds = TelemetryDataset::default();
            ds.add_parameter(sample(name, time, RawValue::Unsigned(1)));
            ds
        };

        let left = mk("a", 0.0).merge(mk("a", 1.0)).merge(mk("b", 2.0));
        let right = mk("a", 0.0).merge(mk("a", 1.0).merge(mk("b", 2.0)));

        assert_eq!(left.sample_count(), right.sample_count());
        assert_eq!(
            left.parameter("a").unwrap().samples,
            right.parameter("a").unwrap().samples
        );
        assert_eq!(
            left.parameter("b").unwrap().samples,
            right.parameter("b").unwrap().samples
        );
    }
}
