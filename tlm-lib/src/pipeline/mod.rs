//! Pipeline orchestration: scanner batches through transforms to a sink.
//!
//! The orchestrator is single-threaded and pull-based; it drives the batch
//! iterator one batch at a time and no batch begins processing before the
//! previous batch's sink call returns.

mod metrics;

pub use metrics::{PipelineMetrics, StageMetric};

use std::fmt::Display;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::dataset::TelemetryDataset;
use crate::{Error, Result};

/// A stage that mutates or enriches a dataset in place.
pub trait Transform {
    /// Stage name used for reporting.
    fn name(&self) -> &str;

    /// Apply this transformation to the dataset.
    ///
    /// # Errors
    /// Stage-level failures only; field-level anomalies are expected to be
    /// absorbed by the stage itself.
    fn apply(&self, dataset: &mut TelemetryDataset) -> Result<()>;
}

/// A terminal stage that persists a dataset.
pub trait Sink {
    /// Stage name used for reporting.
    fn name(&self) -> &str;

    /// Write the dataset to the underlying store.
    ///
    /// # Errors
    /// Any write error; recorded by the orchestrator as a batch-level error.
    fn load(&mut self, dataset: &TelemetryDataset) -> Result<()>;
}

/// Purely observational callbacks for pipeline progress; never required for
/// correctness. All methods default to no-ops.
pub trait Observer {
    fn on_run_start(&mut self, _pipeline: &str) {}
    /// A batch was produced by the source, before any transform ran.
    fn on_batch(&mut self, _index: usize, _dataset: &TelemetryDataset) {}
    /// A transform or sink finished for one batch.
    fn on_stage(&mut self, _index: usize, _result: &StageResult) {}
    fn on_run_complete(&mut self, _result: &RunResult) {}
}

/// Lifecycle of a single run. No retry at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Failed,
}

/// Outcome of a single stage execution over one batch.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub batch: usize,
    pub status: StageStatus,
    pub elapsed: Duration,
    /// Packets entering the stage.
    pub records_in: usize,
    /// Packets leaving the stage.
    pub records_out: usize,
    pub error: Option<String>,
}

/// An error captured during a run, with enough context to locate the
/// offending batch.
#[derive(Debug)]
pub struct RunError {
    pub stage: String,
    pub batch: usize,
    pub error: Error,
}

impl Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} batch {}: {}", self.stage, self.batch, self.error)
    }
}

/// Aggregated result of a complete run.
#[derive(Debug)]
pub struct RunResult {
    pub pipeline: String,
    pub status: RunStatus,
    pub elapsed: Duration,
    pub batches_processed: usize,
    pub total_packets: usize,
    pub stage_results: Vec<StageResult>,
    /// All captured errors in the order encountered.
    pub errors: Vec<RunError>,
}

impl RunResult {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Multi-line human readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Pipeline '{}': {}", self.pipeline, self.status),
            format!("  elapsed   : {:.3}s", self.elapsed.as_secs_f64()),
            format!("  batches   : {}", self.batches_processed),
            format!("  packets   : {}", self.total_packets),
        ];
        if !self.errors.is_empty() {
            lines.push(format!("  errors    : {}", self.errors.len()));
            for err in &self.errors {
                lines.push(format!("    {err}"));
            }
        }
        for r in &self.stage_results {
            let status = match r.status {
                StageStatus::Success => "success",
                StageStatus::Failed => "failed",
            };
            lines.push(format!(
                "  [{}#{}] {} in={} out={} t={:.3}s",
                r.stage,
                r.batch,
                status,
                r.records_in,
                r.records_out,
                r.elapsed.as_secs_f64()
            ));
        }
        lines.join("\n")
    }
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineConfig {
    #[builder(setter(into))]
    pub name: String,

    /// When true the first stage failure aborts the whole run; otherwise the
    /// run continues to the next batch accumulating errors, and a failing
    /// batch is still passed to the sink in whatever state it reached.
    #[builder(default = true)]
    pub stop_on_error: bool,

    /// Stop the run with [RunStatus::Success] after this many batches.
    #[builder(default, setter(strip_option))]
    pub max_batches: Option<usize>,

    /// Run scanner and transforms but suppress the sink call.
    #[builder(default = false)]
    pub dry_run: bool,
}

/// Orchestrates a run: batch source, N transforms, optional sink.
///
/// # Example
/// ```
/// use tlm::pipeline::{Pipeline, PipelineConfig};
/// use tlm::spacepacket::{scan, ScanConfig};
///
/// let dat: &[u8] = &[0xd, 0x59, 0xd2, 0xab, 0x0, 0x0, 0xff];
/// let mut pipeline = Pipeline::new(PipelineConfig::builder().name("ingest").build());
/// let result = pipeline.run(scan(dat, ScanConfig::default()));
/// assert!(result.ok());
/// assert_eq!(result.total_packets, 1);
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    transforms: Vec<Box<dyn Transform>>,
    sink: Option<Box<dyn Sink>>,
    observers: Vec<Box<dyn Observer>>,
    metrics: PipelineMetrics,
    state: RunStatus,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let metrics = PipelineMetrics::new(config.name.clone());
        Pipeline {
            config,
            transforms: Vec::new(),
            sink: None,
            observers: Vec::new(),
            metrics,
            state: RunStatus::Pending,
        }
    }

    /// Append a transform stage; stages run in the order added.
    #[must_use]
    pub fn with_transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    #[must_use]
    pub fn state(&self) -> RunStatus {
        self.state
    }

    /// Per-run stage counters accumulated so far.
    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Execute the pipeline synchronously over `batches`.
    pub fn run<I>(&mut self, batches: I) -> RunResult
    where
        I: IntoIterator<Item = TelemetryDataset>,
    {
        let start = Instant::now();
        self.state = RunStatus::Running;
        let mut stage_results: Vec<StageResult> = Vec::new();
        let mut errors: Vec<RunError> = Vec::new();
        let mut batches_processed = 0;
        let mut total_packets = 0;

        info!(
            pipeline = %self.config.name,
            dry_run = self.config.dry_run,
            "starting run"
        );
        self.metrics.on_run_start(&self.config.name);
        for o in &mut self.observers {
            o.on_run_start(&self.config.name);
        }

        let mut aborted = false;
        'batches: for (index, mut dataset) in batches.into_iter().enumerate() {
            debug!(batch = index, packets = dataset.len(), "batch extracted");
            self.metrics.on_batch(index, &dataset);
            for o in &mut self.observers {
                o.on_batch(index, &dataset);
            }

            for transform in &self.transforms {
                let (result, err) = timed_apply(transform.as_ref(), index, &mut dataset);
                self.metrics.on_stage(index, &result);
                for o in &mut self.observers {
                    o.on_stage(index, &result);
                }
                stage_results.push(result);

                if let Some(err) = err {
                    warn!(stage = transform.name(), batch = index, %err, "transform failed");
                    errors.push(RunError {
                        stage: transform.name().to_string(),
                        batch: index,
                        error: err,
                    });
                    if self.config.stop_on_error {
                        aborted = true;
                        break 'batches;
                    }
                }
            }

            if let Some(sink) = self.sink.as_deref_mut() {
                if self.config.dry_run {
                    debug!(batch = index, "dry run, skipping sink");
                } else {
                    let (result, err) = timed_load(sink, index, &dataset);
                    self.metrics.on_stage(index, &result);
                    for o in &mut self.observers {
                        o.on_stage(index, &result);
                    }
                    stage_results.push(result);

                    if let Some(err) = err {
                        warn!(sink = sink.name(), batch = index, %err, "sink failed");
                        errors.push(RunError {
                            stage: sink.name().to_string(),
                            batch: index,
                            error: err,
                        });
                        if self.config.stop_on_error {
                            aborted = true;
                            break 'batches;
                        }
                    }
                }
            }

            batches_processed += 1;
            total_packets += dataset.len();

            if let Some(max) = self.config.max_batches {
                if batches_processed >= max {
                    info!(max, "max batches reached");
                    break;
                }
            }
        }

        self.state = if aborted || !errors.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let result = RunResult {
            pipeline: self.config.name.clone(),
            status: self.state,
            elapsed: start.elapsed(),
            batches_processed,
            total_packets,
            stage_results,
            errors,
        };

        info!(
            pipeline = %self.config.name,
            status = %result.status,
            batches = result.batches_processed,
            packets = result.total_packets,
            "run complete"
        );
        self.metrics.on_run_complete(&result);
        for o in &mut self.observers {
            o.on_run_complete(&result);
        }
        result
    }
}

fn timed_apply(
    transform: &dyn Transform,
    batch: usize,
    dataset: &mut TelemetryDataset,
) -> (StageResult, Option<Error>) {
    let t0 = Instant::now();
    let records_in = dataset.len();
    let zult = transform.apply(dataset);
    let elapsed = t0.elapsed();
    match zult {
        Ok(()) => (
            StageResult {
                stage: transform.name().to_string(),
                batch,
                status: StageStatus::Success,
                elapsed,
                records_in,
                records_out: dataset.len(),
                error: None,
            },
            None,
        ),
        Err(err) => (
            StageResult {
                stage: transform.name().to_string(),
                batch,
                status: StageStatus::Failed,
                elapsed,
                records_in,
                records_out: dataset.len(),
                error: Some(err.to_string()),
            },
            Some(err),
        ),
    }
}

fn timed_load(
    sink: &mut dyn Sink,
    batch: usize,
    dataset: &TelemetryDataset,
) -> (StageResult, Option<Error>) {
    let t0 = Instant::now();
    let records_in = dataset.len();
    let zult = sink.load(dataset);
    let elapsed = t0.elapsed();
    match zult {
        Ok(()) => (
            StageResult {
                stage: sink.name().to_string(),
                batch,
                status: StageStatus::Success,
                elapsed,
                records_in,
                records_out: records_in,
                error: None,
            },
            None,
        ),
        Err(err) => (
            StageResult {
                stage: sink.name().to_string(),
                batch,
                status: StageStatus::Failed,
                elapsed,
                records_in,
                records_out: 0,
                error: Some(err.to_string()),
            },
            Some(err),
        ),
    }
}
