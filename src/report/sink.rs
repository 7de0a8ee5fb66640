//! Reporting sink: renders a finalized report somewhere a human can read it.

use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{ReportContext, TestDetailRecord};
use crate::analysis::export;

pub trait ReportSink: Send + Sync {
    /// Render the report and return where it was written.
    fn publish(&self, report: &ReportContext, details: &[TestDetailRecord]) -> Result<String>;
}

/// Writes `<dir>/<report_id>.csv`.
pub struct CsvFileSink {
    dir: PathBuf,
}

impl CsvFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ReportSink for CsvFileSink {
    fn publish(&self, report: &ReportContext, details: &[TestDetailRecord]) -> Result<String> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create report dir {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.csv", report.report_id));
        std::fs::write(&path, export::report_csv(report, details))
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(path.display().to_string())
    }
}
