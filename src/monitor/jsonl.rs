//! JSON Lines metric sink.

use super::Monitor;
use crate::error::Result;
use crate::models::MetricReport;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Writes each report as one JSON object per line.
pub struct JsonlMonitor<W: Write> {
    writer: BufWriter<W>,
    written: usize,
}

impl JsonlMonitor<File> {
    /// Create (or truncate) a metrics file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        info!("Writing metrics to: {}", path.display());
        Ok(Self::new(file))
    }
}

impl<W: Write> JsonlMonitor<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            written: 0,
        }
    }

    /// Reports written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| e.into_error().into())
    }
}

impl<W: Write> Monitor for JsonlMonitor<W> {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }
}
