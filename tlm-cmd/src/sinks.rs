//! Thin persistence sinks wrapping the pipeline [Sink] boundary.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tlm::dataset::TelemetryDataset;
use tlm::pipeline::Sink;
use tlm::{Error, Result};

fn sink_err(err: std::io::Error) -> Error {
    Error::Sink(err.to_string())
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Writes one CSV file per parameter, samples sorted by time.
///
/// The first batch for a parameter truncates any existing file and writes a
/// header row; later batches append.
pub struct CsvSink {
    dir: PathBuf,
    started: HashSet<String>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CsvSink {
            dir: dir.into(),
            started: HashSet::new(),
        }
    }
}

impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn load(&mut self, dataset: &TelemetryDataset) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(sink_err)?;

        let mut names = dataset.parameter_names();
        names.sort_unstable();
        for name in names {
            let record = dataset.parameter(name).expect("name from dataset");
            if record.samples.is_empty() {
                continue;
            }

            let path = self.dir.join(format!("{name}.csv"));
            let first = self.started.insert(name.to_string());
            let file = if first {
                File::create(&path).map_err(sink_err)?
            } else {
                OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(sink_err)?
            };
            let mut w = BufWriter::new(file);
            if first {
                writeln!(
                    w,
                    "time,apid,seq_count,raw_value,eng_value,unit,validity,out_of_limit,alarm_level,calibration"
                )
                .map_err(sink_err)?;
            }
            for s in record.samples_by_time() {
                writeln!(
                    w,
                    "{},{},{},{},{},{},{},{},{},{}",
                    s.sample_time,
                    s.apid,
                    s.seq_count,
                    csv_field(&s.raw_value.to_string()),
                    csv_field(&s.eng_value.to_string()),
                    csv_field(s.unit.as_deref().unwrap_or("")),
                    s.validity,
                    s.out_of_limit,
                    s.alarm_level,
                    s.calibration_id.as_deref().unwrap_or(""),
                )
                .map_err(sink_err)?;
            }
            w.flush().map_err(sink_err)?;
        }
        Ok(())
    }
}

/// Writes every sample as one JSON object per line to a single file.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlSink {
            path: path.into(),
            writer: None,
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(sink_err)?;
            }
            let file = File::create(&self.path).map_err(sink_err)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().expect("writer just created"))
    }
}

impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn load(&mut self, dataset: &TelemetryDataset) -> Result<()> {
        let mut names = dataset.parameter_names();
        names.sort_unstable();
        let w = self.writer()?;
        for name in names {
            let record = dataset.parameter(name).expect("name from dataset");
            for sample in record.samples_by_time() {
                let line = serde_json::to_string(sample)
                    .map_err(|err| Error::Sink(err.to_string()))?;
                writeln!(w, "{line}").map_err(sink_err)?;
            }
        }
        w.flush().map_err(sink_err)?;
        Ok(())
    }
}
