//! Analytics over execution history: summaries, trends, heatmaps and
//! regression classification.
//!
//! Everything here is read-only. A storage outage degrades to empty/zero
//! results instead of an error.

pub mod export;
pub mod series;
pub mod stats;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::report::{ReportContext, TestStatus};
use crate::storage::{run_blocking, ExecutionFilter, ExecutionRecord, ReportFilter, ReportStore};

pub use self::series::{
    DailyPoint, HeatmapRow, ReportBreakdown, TestMatrixEntry, TimeWindow, TopFailure,
};
pub use self::stats::{Summary, Trend};

/// Everything the dashboard shows for one window, computed in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub window: TimeWindow,
    pub summary: Summary,
    pub breakdown: ReportBreakdown,
    pub daily: Vec<DailyPoint>,
    pub top_failures: Vec<TopFailure>,
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Arc<dyn ReportStore>,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    async fn executions(&self, filter: ExecutionFilter) -> Vec<ExecutionRecord> {
        match run_blocking(&self.store, move |s| s.query_executions(&filter)).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Execution history unavailable, returning empty analytics: {}", e);
                Vec::new()
            }
        }
    }

    async fn reports(&self, window: &TimeWindow) -> Vec<ReportContext> {
        let filter = ReportFilter {
            from: Some(window.from),
            to: Some(window.to),
            ..Default::default()
        };
        match run_blocking(&self.store, move |s| s.list_reports(&filter)).await {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Report history unavailable, returning empty breakdown: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn summary(&self, window: TimeWindow) -> Summary {
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        stats::summarize(&records)
    }

    pub async fn daily_trend(&self, window: TimeWindow) -> Vec<DailyPoint> {
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        series::daily_trend(&records, &window)
    }

    /// Per-test matrix over the last `days` days. Filters apply to individual
    /// execution records before grouping.
    pub async fn test_matrix(
        &self,
        days: u32,
        suite: Option<String>,
        status: Option<TestStatus>,
    ) -> Vec<TestMatrixEntry> {
        self.test_matrix_at(Utc::now(), days, suite, status).await
    }

    pub async fn test_matrix_at(
        &self,
        now: DateTime<Utc>,
        days: u32,
        suite: Option<String>,
        status: Option<TestStatus>,
    ) -> Vec<TestMatrixEntry> {
        let window = TimeWindow::last_days(now, days);
        let mut filter = ExecutionFilter::window(window.from, window.to);
        filter.suite = suite;
        filter.status = status;
        let records = self.executions(filter).await;
        series::test_matrix(&records)
    }

    pub async fn failure_heatmap(&self, days: u32) -> Vec<HeatmapRow> {
        self.failure_heatmap_at(Utc::now(), days).await
    }

    pub async fn failure_heatmap_at(&self, now: DateTime<Utc>, days: u32) -> Vec<HeatmapRow> {
        let window = TimeWindow::last_days(now, days);
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        series::failure_heatmap(&records, &window)
    }

    /// Most-failing tests over the default window.
    pub async fn top_failures(&self, limit: usize) -> Vec<TopFailure> {
        self.top_failures_in(TimeWindow::default_at(Utc::now()), limit).await
    }

    pub async fn top_failures_in(&self, window: TimeWindow, limit: usize) -> Vec<TopFailure> {
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        series::top_failures(&records, limit)
    }

    pub async fn breakdown(&self, window: TimeWindow) -> ReportBreakdown {
        series::report_breakdown(&self.reports(&window).await)
    }

    pub async fn snapshot(&self, window: TimeWindow, top_limit: usize) -> AnalyticsSnapshot {
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        let reports = self.reports(&window).await;
        AnalyticsSnapshot {
            window,
            summary: stats::summarize(&records),
            breakdown: series::report_breakdown(&reports),
            daily: series::daily_trend(&records, &window),
            top_failures: series::top_failures(&records, top_limit),
        }
    }

    /// Raw execution rows for the window as CSV.
    pub async fn export_executions(&self, window: TimeWindow) -> String {
        let records = self.executions(ExecutionFilter::window(window.from, window.to)).await;
        export::executions_csv(&records)
    }

    pub async fn export_summary(&self, window: TimeWindow) -> String {
        export::summary_csv(&self.summary(window).await)
    }
}
