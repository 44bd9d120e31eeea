//! Calibration: converting raw digital values to engineering units.
//!
//! Two numeric transforms are supported besides identity:
//!
//! - polynomial: `eng = c0 + c1*raw + c2*raw^2 + ... + cN*raw^N`
//! - table: piecewise linear interpolation of (raw, eng) breakpoints with
//!   clamped extrapolation

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{EngValue, EngineeringParameter, ParameterRecord, TelemetryDataset};
use crate::pipeline::Transform;
use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMethod {
    Polynomial,
    Table,
    #[default]
    Identity,
}

impl CalibrationMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMethod::Polynomial => "polynomial",
            CalibrationMethod::Table => "table",
            CalibrationMethod::Identity => "identity",
        }
    }
}

/// A single calibration specification for one parameter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CalibrationEntry {
    pub parameter_name: String,
    #[serde(default)]
    pub method: CalibrationMethod,
    /// Engineering unit applied to calibrated samples.
    #[serde(default)]
    pub unit: Option<String>,
    /// Polynomial coefficients, low to high order. Empty behaves as
    /// identity.
    #[serde(default)]
    pub coefficients: Vec<f64>,
    /// Raw breakpoints for table interpolation; must be non-decreasing.
    #[serde(default)]
    pub table_raw: Vec<f64>,
    /// Engineering values corresponding to `table_raw`.
    #[serde(default)]
    pub table_eng: Vec<f64>,
}

impl CalibrationEntry {
    fn validate(&self) -> Result<()> {
        if self.method != CalibrationMethod::Table {
            return Ok(());
        }
        let reason = if self.table_raw.is_empty() {
            Some("table breakpoints must be non-empty".to_string())
        } else if self.table_raw.len() != self.table_eng.len() {
            Some(format!(
                "table lengths differ: {} raw, {} eng",
                self.table_raw.len(),
                self.table_eng.len()
            ))
        } else if self.table_raw.windows(2).any(|w| w[0] > w[1]) {
            Some("table raw breakpoints must be non-decreasing".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => Err(Error::InvalidDefinition {
                name: self.parameter_name.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Apply this calibration to a raw value.
    #[must_use]
    pub fn apply(&self, raw: f64) -> f64 {
        match self.method {
            CalibrationMethod::Polynomial => {
                if self.coefficients.is_empty() {
                    return raw;
                }
                // Horner evaluation of c0 + c1*raw + ...
                self.coefficients
                    .iter()
                    .rev()
                    .fold(0.0, |acc, c| acc * raw + c)
            }
            CalibrationMethod::Table => interpolate(raw, &self.table_raw, &self.table_eng),
            CalibrationMethod::Identity => raw,
        }
    }
}

/// Piecewise linear interpolation with clamped extrapolation.
fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    if x <= xs[0] {
        return ys[0];
    }
    let last = xs.len() - 1;
    if x >= xs[last] {
        return ys[last];
    }
    // first index with xs[hi] > x; xs[hi-1] <= x < xs[hi]
    let hi = xs.partition_point(|v| *v <= x);
    let (x0, x1) = (xs[hi - 1], xs[hi]);
    let (y0, y1) = (ys[hi - 1], ys[hi]);
    y0 + (x - x0) / (x1 - x0) * (y1 - y0)
}

/// Applies calibrations to parameter records already in a dataset.
///
/// The name index is built once at construction and read-only afterwards.
pub struct Calibration {
    by_name: HashMap<String, CalibrationEntry>,
}

impl Calibration {
    /// Build the calibration engine, validating every entry.
    ///
    /// # Errors
    /// [Error::InvalidDefinition] for table entries with mismatched lengths
    /// or breakpoints out of order.
    pub fn new(entries: Vec<CalibrationEntry>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for entry in entries {
            entry.validate()?;
            by_name.insert(entry.parameter_name.clone(), entry);
        }
        Ok(Calibration { by_name })
    }

    fn calibrate(&self, entry: &CalibrationEntry, sample: &EngineeringParameter) -> EngineeringParameter {
        match numeric_raw(sample) {
            Ok(raw) => {
                let mut updated = sample.clone();
                updated.eng_value = EngValue::Double(entry.apply(raw));
                updated.unit = entry.unit.clone().or_else(|| sample.unit.clone());
                updated.calibration_id = Some(entry.method.as_str().to_string());
                updated
            }
            Err(err) => {
                // non-numeric raw payloads are expected for some parameters
                debug!(%err, "passing sample through uncalibrated");
                sample.clone()
            }
        }
    }
}

fn numeric_raw(sample: &EngineeringParameter) -> Result<f64> {
    sample
        .raw_value
        .as_f64()
        .ok_or_else(|| Error::CalibrationTypeMismatch(sample.name.clone()))
}

impl Transform for Calibration {
    fn name(&self) -> &str {
        "calibration"
    }

    fn apply(&self, dataset: &mut TelemetryDataset) -> Result<()> {
        for record in dataset.parameters.values_mut() {
            let Some(entry) = self.by_name.get(&record.name) else {
                continue;
            };
            let samples = record
                .samples
                .iter()
                .map(|s| self.calibrate(entry, s))
                .collect();
            // rebuild rather than mutate the frozen record
            *record = ParameterRecord {
                name: record.name.clone(),
                unit: entry.unit.clone().or_else(|| record.unit.clone()),
                samples,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::RawValue;

    fn entry(name: &str, method: CalibrationMethod) -> CalibrationEntry {
        CalibrationEntry {
            parameter_name: name.to_string(),
            method,
            unit: None,
            coefficients: Vec::new(),
            table_raw: Vec::new(),
            table_eng: Vec::new(),
        }
    }

    fn sample(name: &str, raw: RawValue) -> EngineeringParameter {
        EngineeringParameter {
            name: name.to_string(),
            apid: 100,
            seq_count: 0,
            sample_time: 0.0,
            eng_value: EngValue::from(&raw),
            raw_value: raw,
            unit: Some("raw".to_string()),
            validity: true,
            out_of_limit: false,
            alarm_level: 0,
            calibration_id: None,
        }
    }

    #[test]
    fn polynomial_temperature_conversion() {
        let mut cal = entry("temp", CalibrationMethod::Polynomial);
        cal.coefficients = vec![-273.15, 0.5];
        assert_eq!(cal.apply(0.0), -273.15);
        assert!((cal.apply(200.0) - (-173.15)).abs() < 1e-6);
    }

    #[test]
    fn polynomial_empty_coefficients_is_identity() {
        let cal = entry("x", CalibrationMethod::Polynomial);
        assert_eq!(cal.apply(42.0), 42.0);
    }

    #[test]
    fn table_interpolates_and_clamps() {
        let mut cal = entry("x", CalibrationMethod::Table);
        cal.table_raw = vec![0.0, 100.0, 200.0];
        cal.table_eng = vec![0.0, 10.0, 20.0];
        assert_eq!(cal.apply(50.0), 5.0);
        assert_eq!(cal.apply(-10.0), 0.0);
        assert_eq!(cal.apply(300.0), 20.0);
        assert_eq!(cal.apply(100.0), 10.0);
    }

    #[test]
    fn table_validation() {
        let mut cal = entry("x", CalibrationMethod::Table);
        assert!(Calibration::new(vec![cal.clone()]).is_err(), "empty table");

        cal.table_raw = vec![0.0, 100.0];
        cal.table_eng = vec![0.0];
        assert!(
            Calibration::new(vec![cal.clone()]).is_err(),
            "length mismatch"
        );

        cal.table_raw = vec![100.0, 0.0];
        cal.table_eng = vec![0.0, 10.0];
        assert!(Calibration::new(vec![cal]).is_err(), "descending raw");
    }

    #[test]
    fn calibrates_matching_records_only() {
        let mut cal = entry("temp", CalibrationMethod::Polynomial);
        cal.coefficients = vec![-273.15, 0.5];
        cal.unit = Some("degC".to_string());
        let engine = Calibration::new(vec![cal]).unwrap();

        let mut ds = TelemetryDataset::default();
        ds.add_parameter(sample("temp", RawValue::Unsigned(200)));
        ds.add_parameter(sample("other", RawValue::Unsigned(1)));
        engine.apply(&mut ds).unwrap();

        let temp = &ds.parameter("temp").unwrap().samples[0];
        match temp.eng_value {
            EngValue::Double(v) => assert!((v - (-173.15)).abs() < 1e-6),
            ref other => panic!("expected calibrated double, got {other:?}"),
        }
        assert_eq!(temp.unit.as_deref(), Some("degC"));
        assert_eq!(temp.calibration_id.as_deref(), Some("polynomial"));
        // raw value kept for audit
        assert_eq!(temp.raw_value, RawValue::Unsigned(200));

        let other = &ds.parameter("other").unwrap().samples[0];
        assert_eq!(other.eng_value, EngValue::Unsigned(1));
        assert!(other.calibration_id.is_none());
    }

    #[test]
    fn non_numeric_raw_passes_through() {
        let mut cal = entry("dump", CalibrationMethod::Polynomial);
        cal.coefficients = vec![0.0, 2.0];
        let engine = Calibration::new(vec![cal]).unwrap();

        let mut ds = TelemetryDataset::default();
        ds.add_parameter(sample("dump", RawValue::Opaque(vec![0xde, 0xad])));
        engine.apply(&mut ds).unwrap();

        let s = &ds.parameter("dump").unwrap().samples[0];
        assert_eq!(s.eng_value, EngValue::Text("dead".to_string()));
        assert!(s.calibration_id.is_none());
    }

    #[test]
    fn validity_and_alarm_fields_carried_through() {
        let mut cal = entry("temp", CalibrationMethod::Identity);
        cal.unit = Some("V".to_string());
        let engine = Calibration::new(vec![cal]).unwrap();

        let mut s = sample("temp", RawValue::Unsigned(5));
        s.validity = false;
        s.out_of_limit = true;
        s.alarm_level = 2;
        let mut ds = TelemetryDataset::default();
        ds.add_parameter(s);
        engine.apply(&mut ds).unwrap();

        let out = &ds.parameter("temp").unwrap().samples[0];
        assert!(!out.validity);
        assert!(out.out_of_limit);
        assert_eq!(out.alarm_level, 2);
        assert_eq!(out.eng_value, EngValue::Double(5.0));
    }
}
