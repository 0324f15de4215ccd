//! Markdown and JSON rendering of run summaries.

use crate::models::{ParameterSummary, RunSummary};
use anyhow::{Context, Result};
use std::path::Path;

/// Generate a complete Markdown summary.
pub fn generate_markdown_summary(summary: &RunSummary) -> String {
    let mut output = String::new();

    output.push_str("# gradtop Run Summary\n\n");
    output.push_str(&generate_overview_section(summary));
    output.push_str(&generate_parameters_section(&summary.parameters));
    output.push_str(&generate_footer());

    output
}

fn generate_overview_section(summary: &RunSummary) -> String {
    let mut section = String::new();

    section.push_str("## Overview\n\n");
    section.push_str(&format!(
        "- **Started:** {}\n",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Steps:** {}\n", summary.steps));
    section.push_str(&format!(
        "- **Reports:** {} (every {} steps)\n",
        summary.flushes, summary.every_n_steps
    ));
    if let Some(first) = summary.first_loss {
        section.push_str(&format!("- **First Reported Loss:** {:.6}\n", first));
    }
    if let Some(last) = summary.last_loss {
        section.push_str(&format!("- **Last Reported Loss:** {:.6}\n", last));
    }
    if let Some(improvement) = summary.loss_improvement() {
        section.push_str(&format!(
            "- **Loss Improvement:** {:.1}%\n",
            improvement * 100.0
        ));
    }
    section.push_str(&format!(
        "- **Duration:** {:.2}s\n",
        summary.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_parameters_section(parameters: &[ParameterSummary]) -> String {
    let mut section = String::new();

    section.push_str("## Parameters\n\n");

    if parameters.is_empty() {
        section.push_str("No gradients were reported.\n\n");
        return section;
    }

    section.push_str("| Parameter | Grad Norm | Weight Norm | Ratio | Reports |\n");
    section.push_str("|:---|---:|---:|---:|:---:|\n");

    for param in parameters {
        let ratio = if param.last_weight_norm > 0.0 {
            format!("{:.2e}", param.last_grad_norm / param.last_weight_norm)
        } else {
            "-".to_string()
        };
        section.push_str(&format!(
            "| `{}` | {:.6} | {:.6} | {} | {} |\n",
            param.name, param.last_grad_norm, param.last_weight_norm, ratio, param.reports
        ));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Generated by gradtop v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON summary.
pub fn generate_json_summary(summary: &RunSummary) -> Result<String> {
    serde_json::to_string_pretty(summary).map_err(Into::into)
}

/// Write rendered summary content to a file.
pub fn write_summary(content: &str, path: &Path) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write summary to {}", path.display()))
}
