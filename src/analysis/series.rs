//! Calendar-aligned and per-test views over execution history.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::stats::{classify_trend, pass_rate, Trend};
use crate::report::{ReportContext, ReportStatus, TestStatus};
use crate::storage::ExecutionRecord;

/// Query window. Records match on `[from, to)`; day series cover every UTC
/// calendar day from `from` through `to` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// `[now - 7d, now)`.
    pub fn default_at(now: DateTime<Utc>) -> Self {
        Self::new(now - Duration::days(7), now)
    }

    /// The `days` calendar days ending today: starts at midnight `days - 1`
    /// days ago and runs up to `now`.
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        let days = days.max(1) as i64;
        let first_day = now.date_naive() - Duration::days(days - 1);
        Self::new(first_day.and_time(chrono::NaiveTime::MIN).and_utc(), now)
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        let (first, last) = (self.from.date_naive(), self.to.date_naive());
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    fn day_index(&self, at: &DateTime<Utc>) -> Option<usize> {
        let offset = (at.date_naive() - self.from.date_naive()).num_days();
        usize::try_from(offset).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub passed: u64,
    pub failed: u64,
}

/// Dense per-day pass/fail counts: one entry for every day of the window.
pub fn daily_trend(records: &[ExecutionRecord], window: &TimeWindow) -> Vec<DailyPoint> {
    let mut points: Vec<DailyPoint> = window
        .days()
        .into_iter()
        .map(|date| DailyPoint { date, passed: 0, failed: 0 })
        .collect();

    for r in records {
        let Some(point) = window.day_index(&r.timestamp).and_then(|i| points.get_mut(i)) else {
            continue;
        };
        match r.status {
            TestStatus::Passed => point.passed += 1,
            TestStatus::Failed | TestStatus::Error => point.failed += 1,
            TestStatus::Skipped => {}
        }
    }
    points
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatmapRow {
    pub test_name: String,
    /// Oldest day first, one entry per window day.
    pub daily_failures: Vec<u64>,
}

/// Per-test failure counts by day, for tests that failed at least once.
/// Rows are sorted by test name.
pub fn failure_heatmap(records: &[ExecutionRecord], window: &TimeWindow) -> Vec<HeatmapRow> {
    let width = window.days().len();
    let mut rows: BTreeMap<&str, Vec<u64>> = BTreeMap::new();

    for r in records.iter().filter(|r| r.status.is_failure()) {
        let Some(idx) = window.day_index(&r.timestamp).filter(|i| *i < width) else {
            continue;
        };
        rows.entry(r.test_name.as_str()).or_insert_with(|| vec![0; width])[idx] += 1;
    }

    rows.into_iter()
        .map(|(name, daily_failures)| HeatmapRow {
            test_name: name.to_string(),
            daily_failures,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestRun {
    pub status: TestStatus,
    pub duration_ms: u64,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMatrixEntry {
    pub test_name: String,
    pub pass_rate: f64,
    pub total_runs: u64,
    pub latest: LatestRun,
    pub trend: Trend,
}

/// Group records by test name and summarize each group. Sorted by test name.
pub fn test_matrix(records: &[ExecutionRecord]) -> Vec<TestMatrixEntry> {
    let mut groups: BTreeMap<&str, Vec<&ExecutionRecord>> = BTreeMap::new();
    for r in records {
        groups.entry(r.test_name.as_str()).or_default().push(r);
    }

    let mut matrix = Vec::with_capacity(groups.len());
    for (name, mut runs) in groups {
        // Stable sort keeps storage order for identical timestamps.
        runs.sort_by_key(|r| r.timestamp);
        let statuses: Vec<TestStatus> = runs.iter().map(|r| r.status).collect();
        let Some(last) = runs.last() else { continue };

        matrix.push(TestMatrixEntry {
            test_name: name.to_string(),
            pass_rate: pass_rate(&statuses),
            total_runs: runs.len() as u64,
            latest: LatestRun {
                status: last.status,
                duration_ms: last.duration_ms,
                environment: last.environment.clone(),
                timestamp: last.timestamp,
            },
            trend: classify_trend(&statuses),
        });
    }
    matrix
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFailure {
    pub test_name: String,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_failure_at: DateTime<Utc>,
}

/// Tests ranked by failure count, ties broken by the most recent failure.
pub fn top_failures(records: &[ExecutionRecord], limit: usize) -> Vec<TopFailure> {
    let mut by_test: HashMap<&str, TopFailure> = HashMap::new();

    for r in records.iter().filter(|r| r.status.is_failure()) {
        let entry = by_test.entry(r.test_name.as_str()).or_insert_with(|| TopFailure {
            test_name: r.test_name.clone(),
            failure_count: 0,
            last_error: None,
            last_failure_at: r.timestamp,
        });
        entry.failure_count += 1;
        if r.timestamp >= entry.last_failure_at {
            entry.last_failure_at = r.timestamp;
            entry.last_error = r.error_message.clone();
        }
    }

    let mut ranked: Vec<TopFailure> = by_test.into_values().collect();
    ranked.sort_by(|a, b| {
        b.failure_count
            .cmp(&a.failure_count)
            .then_with(|| b.last_failure_at.cmp(&a.last_failure_at))
            .then_with(|| a.test_name.cmp(&b.test_name))
    });
    ranked.truncate(limit);
    ranked
}

/// Report counts per status and per suite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportBreakdown {
    pub total_reports: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_suite: BTreeMap<String, u64>,
}

pub fn report_breakdown(reports: &[ReportContext]) -> ReportBreakdown {
    let mut breakdown = ReportBreakdown {
        total_reports: reports.len() as u64,
        ..Default::default()
    };
    for status in [
        ReportStatus::Running,
        ReportStatus::Completed,
        ReportStatus::Failed,
        ReportStatus::Stopped,
    ] {
        breakdown.by_status.insert(status.to_string(), 0);
    }
    for r in reports {
        *breakdown.by_status.entry(r.status.to_string()).or_default() += 1;
        *breakdown.by_suite.entry(r.suite_type.clone()).or_default() += 1;
    }
    breakdown
}
