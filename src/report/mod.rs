//! End-of-run summaries.

pub mod generator;

pub use generator::{generate_json_summary, generate_markdown_summary, write_summary};

use crate::error::Result;
use crate::models::{MetricReport, RunSummary};
use crate::monitor::Monitor;

/// Wraps a monitor and folds every report it forwards into a [`RunSummary`].
pub struct SummaryMonitor<M> {
    inner: M,
    summary: RunSummary,
}

impl<M: Monitor> SummaryMonitor<M> {
    pub fn new(inner: M, every_n_steps: u64) -> Self {
        Self {
            inner,
            summary: RunSummary::new(every_n_steps),
        }
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Split into the wrapped monitor and the collected summary.
    pub fn into_parts(self) -> (M, RunSummary) {
        (self.inner, self.summary)
    }
}

impl<M: Monitor> Monitor for SummaryMonitor<M> {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        self.summary.record(report);
        self.inner.tick(report)
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}
