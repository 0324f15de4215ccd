//! Monitors that receive aggregated metric reports.
//!
//! The [`Monitor`] trait is the contract the aggregator flushes into. This
//! module also ships the stock implementations used by the binary.

pub mod channel;
pub mod jsonl;

pub use channel::{ChannelMonitor, LossWindow, MonitorMessage};
pub use jsonl::JsonlMonitor;

use crate::error::Result;
use crate::models::MetricReport;
use tracing::{debug, info};

/// Receiver of periodic metric reports.
pub trait Monitor {
    /// Deliver one report. Called synchronously from the training loop.
    fn tick(&mut self, report: &MetricReport) -> Result<()>;

    /// Whether the training loop should keep going.
    fn is_running(&self) -> bool {
        true
    }
}

impl<M: Monitor + ?Sized> Monitor for &mut M {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        (**self).tick(report)
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

impl<M: Monitor + ?Sized> Monitor for Box<M> {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        (**self).tick(report)
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Emits each report as `tracing` events.
#[derive(Debug, Default)]
pub struct LogMonitor {
    reports: usize,
}

impl LogMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reports logged so far.
    pub fn reports(&self) -> usize {
        self.reports
    }
}

impl Monitor for LogMonitor {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        self.reports += 1;

        match report.max_grad_norm() {
            Some((name, norm)) => info!("{} max_grad={}:{:.4}", report, name, norm),
            None => info!("{} (no gradients this interval)", report),
        }

        for (name, stat) in report.iter() {
            debug!(
                "  {:<32} grad_norm={:.6} weight_norm={:.6}",
                name, stat.grad_norm, stat.weight_norm
            );
        }
        for (module, fraction) in &report.activations {
            debug!("  {:<32} non_positive_grad={:.1}%", module, fraction * 100.0);
        }

        Ok(())
    }
}

/// Keeps every report in memory.
///
/// Optionally reports itself as stopped once a number of reports has been
/// collected, which lets polling training loops end early.
#[derive(Debug, Default)]
pub struct MemoryMonitor {
    reports: Vec<MetricReport>,
    stop_after: Option<usize>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop running after `reports` reports.
    pub fn stop_after(reports: usize) -> Self {
        Self {
            reports: Vec::new(),
            stop_after: Some(reports),
        }
    }

    pub fn reports(&self) -> &[MetricReport] {
        &self.reports
    }

    pub fn into_reports(self) -> Vec<MetricReport> {
        self.reports
    }
}

impl Monitor for MemoryMonitor {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.stop_after
            .map_or(true, |limit| self.reports.len() < limit)
    }
}
