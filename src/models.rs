//! Data models for gradient monitoring.
//!
//! This module contains the structures that flow from the aggregator to
//! monitors and into the end-of-run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Latest norms recorded for one parameter within a reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamStat {
    /// L2 norm of the gradient.
    pub grad_norm: f64,
    /// L2 norm of the parameter at the time the gradient arrived.
    pub weight_norm: f64,
}

/// One flush of the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Step counter value at the flush.
    pub step: u64,
    /// Loss passed to the tick that triggered the flush.
    pub loss: f64,
    /// Qualified parameter names, sorted.
    pub names: Vec<String>,
    /// Gradient norms, parallel to `names`.
    pub grad_norms: Vec<f64>,
    /// Weight norms, parallel to `names`.
    pub weight_norms: Vec<f64>,
    /// Fraction of non-positive gradient-output entries per leaf module.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activations: BTreeMap<String, f64>,
    /// When the report was produced.
    pub timestamp: DateTime<Utc>,
}

impl MetricReport {
    /// Build a report from per-parameter stats. Names come out sorted.
    pub fn new(
        step: u64,
        loss: f64,
        params: BTreeMap<String, ParamStat>,
        activations: BTreeMap<String, f64>,
    ) -> Self {
        let mut names = Vec::with_capacity(params.len());
        let mut grad_norms = Vec::with_capacity(params.len());
        let mut weight_norms = Vec::with_capacity(params.len());

        for (name, stat) in params {
            names.push(name);
            grad_norms.push(stat.grad_norm);
            weight_norms.push(stat.weight_norm);
        }

        Self {
            step,
            loss,
            names,
            grad_norms,
            weight_norms,
            activations,
            timestamp: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate `(name, stat)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamStat)> + '_ {
        self.names
            .iter()
            .zip(self.grad_norms.iter().zip(&self.weight_norms))
            .map(|(name, (&grad_norm, &weight_norm))| {
                (
                    name.as_str(),
                    ParamStat {
                        grad_norm,
                        weight_norm,
                    },
                )
            })
    }

    /// Norm of all reported gradients taken together.
    pub fn global_grad_norm(&self) -> f64 {
        self.grad_norms.iter().map(|g| g * g).sum::<f64>().sqrt()
    }

    /// Parameter with the largest gradient norm.
    pub fn max_grad_norm(&self) -> Option<(&str, f64)> {
        self.iter()
            .map(|(name, stat)| (name, stat.grad_norm))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step={} loss={:.4} params={} global_grad_norm={:.4}",
            self.step,
            self.loss,
            self.len(),
            self.global_grad_norm()
        )
    }
}

/// Last observed state of one parameter across a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub last_grad_norm: f64,
    pub last_weight_norm: f64,
    /// Number of reports the parameter appeared in.
    pub reports: usize,
}

/// Summary of a monitored training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in seconds.
    pub duration_seconds: f64,
    /// Training steps executed.
    pub steps: u64,
    /// Flush cadence.
    pub every_n_steps: u64,
    /// Reports delivered to the monitor.
    pub flushes: usize,
    /// Loss in the first report.
    pub first_loss: Option<f64>,
    /// Loss in the most recent report.
    pub last_loss: Option<f64>,
    /// Per-parameter state, sorted by name.
    pub parameters: Vec<ParameterSummary>,
}

impl RunSummary {
    pub fn new(every_n_steps: u64) -> Self {
        Self {
            started_at: Utc::now(),
            duration_seconds: 0.0,
            steps: 0,
            every_n_steps,
            flushes: 0,
            first_loss: None,
            last_loss: None,
            parameters: Vec::new(),
        }
    }

    /// Fold one report into the summary.
    pub fn record(&mut self, report: &MetricReport) {
        self.flushes += 1;
        self.steps = self.steps.max(report.step);
        self.first_loss.get_or_insert(report.loss);
        self.last_loss = Some(report.loss);

        for (name, stat) in report.iter() {
            match self
                .parameters
                .binary_search_by(|p| p.name.as_str().cmp(name))
            {
                Ok(idx) => {
                    let entry = &mut self.parameters[idx];
                    entry.last_grad_norm = stat.grad_norm;
                    entry.last_weight_norm = stat.weight_norm;
                    entry.reports += 1;
                }
                Err(idx) => self.parameters.insert(
                    idx,
                    ParameterSummary {
                        name: name.to_string(),
                        last_grad_norm: stat.grad_norm,
                        last_weight_norm: stat.weight_norm,
                        reports: 1,
                    },
                ),
            }
        }
    }

    /// Relative loss change between the first and last report.
    pub fn loss_improvement(&self) -> Option<f64> {
        match (self.first_loss, self.last_loss) {
            (Some(first), Some(last)) if first != 0.0 => Some((first - last) / first),
            _ => None,
        }
    }
}
