//! In-process per-run counters.
//!
//! Intentionally simple accumulators; bridge to an external metrics system
//! through a custom [Observer] when needed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use super::{Observer, StageResult, StageStatus};
use crate::dataset::TelemetryDataset;

/// Per-stage accumulated counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StageMetric {
    pub name: String,
    pub invocations: usize,
    pub records_in: usize,
    pub records_out: usize,
    pub errors: usize,
    pub total_elapsed: Duration,
}

impl StageMetric {
    #[must_use]
    pub fn avg_elapsed(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.total_elapsed / self.invocations as u32
        }
    }

    /// Records processed per second across all invocations.
    #[must_use]
    pub fn throughput_rps(&self) -> f64 {
        let secs = self.total_elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.records_out as f64 / secs
        }
    }
}

/// Accumulator for a single pipeline's stage counters.
///
/// Implements [Observer] so it can be fed by the orchestrator; the pipeline
/// carries one internally and external copies may be attached as additional
/// observers.
#[derive(Debug)]
pub struct PipelineMetrics {
    pipeline: String,
    started: Instant,
    batches: usize,
    total_packets: usize,
    stages: BTreeMap<String, StageMetric>,
}

impl PipelineMetrics {
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        PipelineMetrics {
            pipeline: pipeline.into(),
            started: Instant::now(),
            batches: 0,
            total_packets: 0,
            stages: BTreeMap::new(),
        }
    }

    pub fn record_batch(&mut self, packet_count: usize) {
        self.batches += 1;
        self.total_packets += packet_count;
    }

    pub fn record_stage(
        &mut self,
        stage: &str,
        records_in: usize,
        records_out: usize,
        elapsed: Duration,
        error: bool,
    ) {
        let metric = self
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| StageMetric {
                name: stage.to_string(),
                ..StageMetric::default()
            });
        metric.invocations += 1;
        metric.records_in += records_in;
        metric.records_out += records_out;
        metric.total_elapsed += elapsed;
        if error {
            metric.errors += 1;
        }
    }

    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches
    }

    #[must_use]
    pub fn total_packets(&self) -> usize {
        self.total_packets
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageMetric> {
        self.stages.get(name)
    }

    pub fn all_stages(&self) -> impl Iterator<Item = &StageMetric> {
        self.stages.values()
    }

    /// A serializable snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        json!({
            "pipeline": self.pipeline,
            "elapsed_s": self.elapsed().as_secs_f64(),
            "batches": self.batches,
            "total_packets": self.total_packets,
            "stages": self
                .stages
                .values()
                .map(|m| {
                    (
                        m.name.clone(),
                        json!({
                            "invocations": m.invocations,
                            "records_in": m.records_in,
                            "records_out": m.records_out,
                            "errors": m.errors,
                            "avg_elapsed_s": m.avg_elapsed().as_secs_f64(),
                            "throughput_rps": m.throughput_rps(),
                        }),
                    )
                })
                .collect::<serde_json::Map<String, Value>>(),
        })
    }
}

impl Observer for PipelineMetrics {
    fn on_batch(&mut self, _index: usize, dataset: &TelemetryDataset) {
        self.record_batch(dataset.len());
    }

    fn on_stage(&mut self, _index: usize, result: &StageResult) {
        self.record_stage(
            &result.stage,
            result.records_in,
            result.records_out,
            result.elapsed,
            result.status == StageStatus::Failed,
        );
    }
}
