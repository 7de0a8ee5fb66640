//! Row-oriented delimited-text export.
//!
//! A field containing the delimiter, a double quote, CR or LF is wrapped in
//! double quotes with embedded quotes doubled. `parse` is the exact inverse.

use std::borrow::Cow;

use super::stats::Summary;
use crate::report::{ReportContext, TestDetailRecord};
use crate::storage::{ts, ExecutionRecord};

pub const DEFAULT_DELIMITER: char = ',';

pub fn escape_field(field: &str, delimiter: char) -> Cow<'_, str> {
    let needs_quotes = field
        .chars()
        .any(|c| c == delimiter || c == '"' || c == '\n' || c == '\r');
    if !needs_quotes {
        return Cow::Borrowed(field);
    }
    let mut out = String::with_capacity(field.len() + 2);
    out.push('"');
    for c in field.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    Cow::Owned(out)
}

pub fn format_row<S: AsRef<str>>(fields: &[S], delimiter: char) -> String {
    let mut line = String::new();
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            line.push(delimiter);
        }
        line.push_str(&escape_field(f.as_ref(), delimiter));
    }
    line
}

/// Parse delimited text into rows. Quoted fields may span lines. Rows end at
/// `\n` or `\r\n` outside quotes; a trailing newline does not add an empty row.
pub fn parse(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut row_has_content = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' => {
                in_quotes = true;
                row_has_content = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                row_has_content = false;
            }
            c if c == delimiter => {
                row.push(std::mem::take(&mut field));
                row_has_content = true;
            }
            c => {
                field.push(c);
                row_has_content = true;
            }
        }
    }

    if row_has_content || !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

/// Builds a delimited document row by row.
pub struct CsvWriter {
    delimiter: char,
    out: String,
}

impl CsvWriter {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter, out: String::new() }
    }

    pub fn row<S: AsRef<str>>(&mut self, fields: &[S]) -> &mut Self {
        self.out.push_str(&format_row(fields, self.delimiter));
        self.out.push('\n');
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

impl Default for CsvWriter {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

/// Two-column `metric,value` rendering of a summary.
pub fn summary_csv(summary: &Summary) -> String {
    let mut w = CsvWriter::default();
    w.row(&["metric", "value"])
        .row(&["total".to_string(), summary.total.to_string()])
        .row(&["passed".to_string(), summary.passed.to_string()])
        .row(&["failed".to_string(), summary.failed.to_string()])
        .row(&["skipped".to_string(), summary.skipped.to_string()])
        .row(&["pass_rate".to_string(), format!("{:.2}", summary.pass_rate)])
        .row(&["avg_duration_ms".to_string(), format!("{:.2}", summary.avg_duration_ms)])
        .row(&["p95_duration_ms".to_string(), summary.p95_duration_ms.to_string()]);
    w.finish()
}

pub fn executions_csv(records: &[ExecutionRecord]) -> String {
    let mut w = CsvWriter::default();
    w.row(&[
        "timestamp",
        "report_id",
        "suite",
        "environment",
        "test_name",
        "test_type",
        "status",
        "duration_ms",
        "error_message",
    ]);
    for r in records {
        w.row(&[
            ts(&r.timestamp),
            r.report_id.clone(),
            r.suite_type.clone(),
            r.environment.clone(),
            r.test_name.clone(),
            r.test_type.clone(),
            r.status.to_string(),
            r.duration_ms.to_string(),
            r.error_message.clone().unwrap_or_default(),
        ]);
    }
    w.finish()
}

/// Per-report document: a header block with the aggregate, then one row per test.
pub fn report_csv(report: &ReportContext, details: &[TestDetailRecord]) -> String {
    let mut w = CsvWriter::default();
    w.row(&["report_id", "suite", "environment", "status", "total", "passed", "failed", "skipped", "success_rate"]);
    w.row(&[
        report.report_id.clone(),
        report.suite_type.clone(),
        report.environment.clone(),
        report.status.to_string(),
        report.total_tests.to_string(),
        report.passed_tests.to_string(),
        report.failed_tests.to_string(),
        report.skipped_tests.to_string(),
        format!("{:.2}", report.success_rate),
    ]);
    w.row(&["test_name", "test_type", "status", "start_time", "end_time", "duration_ms", "error_message", "artifact_ref"]);
    for d in details {
        w.row(&[
            d.test_name.clone(),
            d.test_type.clone(),
            d.status.to_string(),
            ts(&d.start_time),
            ts(&d.end_time),
            d.duration_ms.to_string(),
            d.error_message.clone().unwrap_or_default(),
            d.artifact_ref.clone().unwrap_or_default(),
        ]);
    }
    w.finish()
}
