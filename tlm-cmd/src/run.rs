use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use tlm::calibration::{Calibration, CalibrationEntry};
use tlm::decom::{Decom, ParameterDefinition, UnknownApids};
use tlm::pipeline::{Pipeline, PipelineConfig};
use tlm::spacepacket::{scan, ScanConfig};
use tlm::timecode;

use crate::parse_apid_ranges;
use crate::sinks::{CsvSink, JsonlSink};

/// Mission definition file: how packets are laid out and calibrated.
#[derive(Debug, Deserialize)]
pub struct MissionConfig {
    /// Pipeline name used in logs and reports.
    #[serde(default)]
    pub name: Option<String>,
    /// Secondary header length in bytes; mission-specific.
    #[serde(default)]
    pub sec_hdr_length: usize,
    /// Timecode format found at the start of the secondary header.
    #[serde(default)]
    pub timecode: Option<timecode::Format>,
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub calibrations: Vec<CalibrationEntry>,
}

#[derive(Debug, Clone)]
pub enum SinkFormat {
    Csv,
    Jsonl,
}

impl clap::ValueEnum for SinkFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Csv, Self::Jsonl]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Csv => Some(clap::builder::PossibleValue::new("csv")),
            Self::Jsonl => Some(clap::builder::PossibleValue::new("jsonl")),
        }
    }
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Input spacepacket file.
    pub input: PathBuf,

    /// Mission definition file (JSON).
    #[arg(short, long, value_name = "path")]
    pub config: PathBuf,

    /// Directory sink output is written to.
    #[arg(short, long, default_value = "output", value_name = "path")]
    pub output: PathBuf,

    /// Sink output format.
    #[arg(short, long, default_value = "csv")]
    pub format: SinkFormat,

    /// Number of packets per batch.
    #[arg(short, long, default_value_t = 256)]
    pub batch_size: usize,

    /// Stop after this many batches.
    #[arg(long, value_name = "count")]
    pub max_batches: Option<usize>,

    /// Record stage errors and keep going rather than stopping the run at
    /// the first failure.
    #[arg(long, action)]
    pub keep_going: bool,

    /// Fail a batch when a packet's APID has no definitions.
    #[arg(long, action)]
    pub strict: bool,

    /// Run scanner and transforms but do not write to the sink.
    #[arg(long, action)]
    pub dry_run: bool,

    /// Scan for 0x1ACFFC1D sync markers before each packet.
    #[arg(long, action)]
    pub frame_sync: bool,

    /// Only process these apids or apid ranges.
    ///
    /// This accepts a CSV of APIDs as well as ranges of the format
    /// <start>-<end> where start and end are inclusive. For example,
    /// --apids 0-5,10,20
    #[arg(short, long, value_name = "csv", value_delimiter = ',')]
    pub apids: Vec<String>,

    /// Source identifier stamped onto every packet.
    #[arg(long, value_name = "id")]
    pub source_id: Option<String>,
}

pub fn run(args: &RunArgs) -> Result<()> {
    let mission = load_mission(&args.config)?;
    let name = mission.name.clone().unwrap_or_else(|| "tlm-run".to_string());

    let data = std::fs::read(&args.input)
        .with_context(|| format!("reading input {:?}", args.input))?;
    info!(input = ?args.input, bytes = data.len(), "read input");

    let mut scan_config = ScanConfig::builder()
        .batch_size(args.batch_size)
        .sec_hdr_length(mission.sec_hdr_length)
        .frame_sync(args.frame_sync)
        .build();
    scan_config.timecode = mission.timecode.clone();
    scan_config.source_id = args.source_id.clone();
    if !args.apids.is_empty() {
        let apids = parse_apid_ranges(&args.apids)?;
        debug!("including apids {:?}", apids);
        scan_config.apids = Some(apids);
    }

    let unknown = if args.strict {
        UnknownApids::Fail
    } else {
        UnknownApids::Skip
    };
    let decom = Decom::new(mission.parameters, unknown).context("building decom table")?;
    let calibration =
        Calibration::new(mission.calibrations).context("building calibration table")?;

    let mut pipeline_config = PipelineConfig::builder()
        .name(name)
        .stop_on_error(!args.keep_going)
        .dry_run(args.dry_run)
        .build();
    pipeline_config.max_batches = args.max_batches;

    let mut pipeline = Pipeline::new(pipeline_config)
        .with_transform(decom)
        .with_transform(calibration);
    pipeline = match args.format {
        SinkFormat::Csv => pipeline.with_sink(CsvSink::new(&args.output)),
        SinkFormat::Jsonl => pipeline.with_sink(JsonlSink::new(args.output.join("samples.jsonl"))),
    };

    let result = pipeline.run(scan(&data, scan_config));
    println!("{}", result.summary());

    if !result.ok() {
        bail!("run failed with {} error(s)", result.errors.len());
    }
    Ok(())
}

fn load_mission(path: &PathBuf) -> Result<MissionConfig> {
    let file = File::open(path).with_context(|| format!("opening mission file {path:?}"))?;
    let mission: MissionConfig =
        serde_json::from_reader(file).with_context(|| format!("parsing mission file {path:?}"))?;
    if mission.parameters.is_empty() {
        bail!("mission file {path:?} defines no parameters");
    }
    Ok(mission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_mission_file() {
        let text = r#"{
            "name": "hk",
            "sec_hdr_length": 8,
            "timecode": {"format": "cds", "num_day": 2, "num_submillis": 2},
            "parameters": [
                {
                    "name": "hk_temp",
                    "apid": 100,
                    "byte_offset": 0,
                    "bit_length": 16,
                    "param_type": "uint",
                    "unit": "count"
                }
            ],
            "calibrations": [
                {
                    "parameter_name": "hk_temp",
                    "method": "polynomial",
                    "coefficients": [-273.15, 0.5],
                    "unit": "degC"
                }
            ]
        }"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();

        let mission = load_mission(&f.path().to_path_buf()).unwrap();
        assert_eq!(mission.name.as_deref(), Some("hk"));
        assert_eq!(mission.sec_hdr_length, 8);
        assert_eq!(mission.parameters.len(), 1);
        assert_eq!(mission.parameters[0].apid, 100);
        assert_eq!(mission.calibrations.len(), 1);
        assert!(matches!(
            mission.timecode,
            Some(timecode::Format::Cds {
                num_day: 2,
                num_submillis: 2
            })
        ));
    }

    #[test]
    fn rejects_empty_parameter_table() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(br#"{"parameters": []}"#).unwrap();
        assert!(load_mission(&f.path().to_path_buf()).is_err());
    }
}
