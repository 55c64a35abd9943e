//! Operation timing records and the run summary.
//!
//! Every canary step produces a [`Timing`] which is logged as one structured line and, when
//! Datadog is configured, submitted as distributions. [`RunMetrics`] additionally keeps a
//! [`DDSketch`] per step so a latency summary can be logged when the run ends.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use sketches_ddsketch::DDSketch;

/// A step of the canary cycle.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Step {
    CreateBucket,
    CreateObject,
    ReadObject,
    DeleteObject,
    DeleteBucket,
    CleanUp,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::CreateBucket => "create_bucket",
            Step::CreateObject => "create_object",
            Step::ReadObject => "read_object",
            Step::DeleteObject => "delete_object",
            Step::DeleteBucket => "delete_bucket",
            Step::CleanUp => "clean_up",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elapsed time of one canary step, with item and byte counts where they apply.
#[derive(Clone, Debug, PartialEq)]
pub struct Timing {
    pub step: Step,
    pub count: Option<usize>,
    pub bytes: Option<u64>,
    pub elapsed: Duration,
}

impl Timing {
    pub fn new(step: Step, elapsed: Duration) -> Self {
        Self {
            step,
            count: None,
            bytes: None,
            elapsed,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// Logs this record and submits it to the metrics backend.
    pub fn emit(&self) {
        let secs = self.elapsed.as_secs_f64();
        match (self.count, self.bytes) {
            (Some(count), Some(bytes)) => {
                tracing::info!(op = %self.step, count, bytes, secs, "Test:{}", self.step)
            }
            (Some(count), None) => tracing::info!(op = %self.step, count, secs, "Test:{}", self.step),
            _ => tracing::info!(op = %self.step, secs, "Test:{}", self.step),
        }

        merni::distribution!(
            "op.latency"@s: self.elapsed,
            "op" => self.step.as_str()
        );
        if let Some(bytes) = self.bytes {
            merni::distribution!(
                "op.size"@b: bytes,
                "op" => self.step.as_str()
            );
        }
    }
}

/// Latency aggregates over the lifetime of a run.
#[derive(Default)]
pub struct RunMetrics {
    timings: BTreeMap<Step, DDSketch>,
    cycles: u64,
}

impl RunMetrics {
    pub fn record(&mut self, timing: &Timing) {
        self.timings
            .entry(timing.step)
            .or_default()
            .add(timing.elapsed.as_secs_f64());
    }

    pub fn cycle_completed(&mut self) {
        self.cycles += 1;
        merni::counter!("cycle.completed": 1);
    }

    /// Number of cycles that ran to completion.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Number of recorded samples for a step.
    pub fn samples(&self, step: Step) -> usize {
        self.timings.get(&step).map_or(0, |sketch| sketch.count())
    }

    /// Logs one line per step with latency percentiles.
    pub fn log_summary(&self) {
        tracing::info!(cycles = self.cycles, "run summary");
        for (step, sketch) in &self.timings {
            let samples = sketch.count();
            if samples == 0 {
                continue;
            }
            let avg = sketch.sum().unwrap_or_default() / samples as f64;
            let quantile = |q| sketch.quantile(q).ok().flatten().unwrap_or_default();
            tracing::info!(
                op = %step,
                samples,
                avg = ?Duration::from_secs_f64(avg),
                p50 = ?Duration::from_secs_f64(quantile(0.5)),
                p90 = ?Duration::from_secs_f64(quantile(0.9)),
                p99 = ?Duration::from_secs_f64(quantile(0.99)),
                "latency summary"
            );
        }
    }
}

impl fmt::Debug for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunMetrics")
            .field("cycles", &self.cycles)
            .field("steps", &self.timings.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_step() {
        let mut metrics = RunMetrics::default();
        metrics.record(&Timing::new(Step::CreateBucket, Duration::from_millis(12)));
        metrics.record(&Timing::new(Step::CreateBucket, Duration::from_millis(18)));
        metrics.record(
            &Timing::new(Step::CreateObject, Duration::from_millis(40))
                .with_count(3)
                .with_bytes(48),
        );
        metrics.cycle_completed();

        assert_eq!(metrics.samples(Step::CreateBucket), 2);
        assert_eq!(metrics.samples(Step::CreateObject), 1);
        assert_eq!(metrics.samples(Step::ReadObject), 0);
        assert_eq!(metrics.cycles(), 1);

        metrics.log_summary();
    }

    #[test]
    fn step_names() {
        assert_eq!(Step::ReadObject.to_string(), "read_object");
        assert_eq!(Step::CleanUp.as_str(), "clean_up");
    }
}
