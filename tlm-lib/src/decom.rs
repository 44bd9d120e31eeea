//! Decommutation: extracting named parameters from packet user data.
//!
//! Each [ParameterDefinition] describes the location and type of one
//! parameter within a specific APID's user data field, mirroring a mission
//! information base packet definition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dataset::{EngValue, EngineeringParameter, RawValue, TelemetryDataset};
use crate::pipeline::Transform;
use crate::spacepacket::{Apid, Packet};
use crate::{Error, Result};

/// Declared wire type of a parameter. The set is closed by the wire format.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Uint,
    Int,
    Float,
    Double,
    Boolean,
    Enumerated,
    Text,
    Binary,
}

/// Describes how to extract a single parameter from a packet's user data.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParameterDefinition {
    pub name: String,
    pub apid: Apid,
    /// Byte offset into the packet user data.
    pub byte_offset: usize,
    /// Field width in bits. Numeric types must be byte-aligned powers of
    /// two: 8/16/32 or 64.
    pub bit_length: usize,
    pub param_type: ParameterType,
    #[serde(default)]
    pub little_endian: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterDefinition {
    fn byte_count(&self) -> usize {
        self.bit_length.div_ceil(8)
    }

    fn validate(&self) -> Result<()> {
        use ParameterType::{Boolean, Double, Float, Int, Uint};
        let reason = match self.param_type {
            Uint | Int if !matches!(self.bit_length, 8 | 16 | 32 | 64) => {
                Some("integer bit length must be 8, 16, 32, or 64")
            }
            Float if self.bit_length != 32 => Some("float bit length must be 32"),
            Double if self.bit_length != 64 => Some("double bit length must be 64"),
            Boolean if self.bit_length != 8 => Some("boolean bit length must be 8"),
            _ if self.bit_length == 0 => Some("bit length must be non-zero"),
            _ => None,
        };
        match reason {
            Some(reason) => Err(Error::InvalidDefinition {
                name: self.name.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Policy for packets whose APID has no definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownApids {
    /// Skip the packet; the default.
    #[default]
    Skip,
    /// Fail the batch, for strict-mode validation runs where every APID
    /// must be known.
    Fail,
}

/// Extracts named parameters from packet user data using a definition table.
///
/// The APID index is built once at construction and read-only afterwards.
pub struct Decom {
    by_apid: HashMap<Apid, Vec<ParameterDefinition>>,
    unknown_apids: UnknownApids,
}

impl Decom {
    /// Build the decommutation engine, validating every definition.
    ///
    /// # Errors
    /// [Error::InvalidDefinition] for a definition that can never be applied.
    pub fn new(defs: Vec<ParameterDefinition>, unknown_apids: UnknownApids) -> Result<Self> {
        let mut by_apid: HashMap<Apid, Vec<ParameterDefinition>> = HashMap::new();
        for def in defs {
            def.validate()?;
            by_apid.entry(def.apid).or_default().push(def);
        }
        Ok(Decom {
            by_apid,
            unknown_apids,
        })
    }

    /// APIDs with at least one definition.
    #[must_use]
    pub fn apids(&self) -> Vec<Apid> {
        self.by_apid.keys().copied().collect()
    }

    fn extract(&self, packet: &Packet, def: &ParameterDefinition) -> Result<EngineeringParameter> {
        let data = &packet.user_data;
        let count = def.byte_count();
        let end = def.byte_offset + count;
        if end > data.len() {
            return Err(Error::ShortUserData {
                name: def.name.clone(),
                offset: def.byte_offset,
                needed: count,
                available: data.len(),
            });
        }

        let raw = decode_field(&data[def.byte_offset..end], def);
        let eng = EngValue::from(&raw);

        Ok(EngineeringParameter {
            name: def.name.clone(),
            apid: packet.header.apid,
            seq_count: packet.header.sequence_id,
            sample_time: sample_time(packet),
            raw_value: raw,
            eng_value: eng,
            unit: def.unit.clone(),
            validity: true,
            out_of_limit: false,
            alarm_level: 0,
            calibration_id: None,
        })
    }
}

impl Transform for Decom {
    fn name(&self) -> &str {
        "decom"
    }

    fn apply(&self, dataset: &mut TelemetryDataset) -> Result<()> {
        let mut samples = Vec::new();
        for packet in &dataset.packets {
            let Some(defs) = self.by_apid.get(&packet.header.apid) else {
                match self.unknown_apids {
                    UnknownApids::Skip => {
                        trace!(apid = packet.header.apid, "no definitions for apid");
                        continue;
                    }
                    UnknownApids::Fail => return Err(Error::UnknownApid(packet.header.apid)),
                }
            };
            for def in defs {
                match self.extract(packet, def) {
                    Ok(sample) => samples.push(sample),
                    // a short packet is expected operational reality
                    Err(Error::ShortUserData { name, .. }) => {
                        trace!(
                            apid = packet.header.apid,
                            name,
                            "field does not fit in user data"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        for sample in samples {
            dataset.add_parameter(sample);
        }
        Ok(())
    }
}

/// Sample time from the packet source time when present, else the sequence
/// count as an ordering-only surrogate.
fn sample_time(packet: &Packet) -> f64 {
    packet
        .source_time
        .unwrap_or_else(|| f64::from(packet.header.sequence_id))
}

fn decode_field(bytes: &[u8], def: &ParameterDefinition) -> RawValue {
    match def.param_type {
        ParameterType::Uint => RawValue::Unsigned(uint_field(bytes, def.little_endian)),
        ParameterType::Int => RawValue::Signed(int_field(bytes, def.little_endian)),
        ParameterType::Float => {
            // width validated to 32 bits at construction
            let arr: [u8; 4] = bytes.try_into().expect("4 float bytes");
            let v = if def.little_endian {
                f32::from_le_bytes(arr)
            } else {
                f32::from_be_bytes(arr)
            };
            RawValue::Double(f64::from(v))
        }
        ParameterType::Double => {
            // width validated to 64 bits at construction
            let arr: [u8; 8] = bytes.try_into().expect("8 double bytes");
            let v = if def.little_endian {
                f64::from_le_bytes(arr)
            } else {
                f64::from_be_bytes(arr)
            };
            RawValue::Double(v)
        }
        ParameterType::Boolean => RawValue::Boolean(bytes[0] != 0),
        ParameterType::Text => RawValue::Text(text_field(bytes)),
        ParameterType::Binary => RawValue::Opaque(bytes.to_vec()),
        // permissive fallback: any width decodes as a plain unsigned integer
        ParameterType::Enumerated => RawValue::Unsigned(uint_field(bytes, def.little_endian)),
    }
}

fn uint_field(bytes: &[u8], little_endian: bool) -> u64 {
    if little_endian {
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    } else {
        bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    }
}

fn int_field(bytes: &[u8], little_endian: bool) -> i64 {
    let raw = uint_field(bytes, little_endian);
    let bits = bytes.len() * 8;
    if bits >= 64 {
        raw as i64
    } else {
        // sign-extend from the field width
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    }
}

/// ASCII with non-ASCII bytes replaced and trailing NULs trimmed.
fn text_field(bytes: &[u8]) -> String {
    let s: String = bytes
        .iter()
        .map(|b| {
            if b.is_ascii() {
                char::from(*b)
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect();
    s.trim_end_matches('\0').to_string()
}
