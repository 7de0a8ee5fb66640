//! Analytics over a real SQLite history.

mod common;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use common::{detail, FlakyStore};
use testmill::analysis::{AnalyticsEngine, Summary, TimeWindow, Trend};
use testmill::report::{ReportContext, ReportStatus, TestStatus, TriggerType};
use testmill::storage::{ReportStore, SqliteStore};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, day, hour, 0, 0).unwrap()
}

fn now() -> DateTime<Utc> {
    at(10, 12)
}

/// Six daily regression runs, July 4th to 9th:
/// `login` fails the first three days, `checkout` the last three, `search`
/// runs (and passes) on the 8th and 9th only.
fn seed(store: &dyn ReportStore) -> Result<()> {
    for (i, day) in (4..=9).enumerate() {
        let started = at(day, 10);
        let mut report = ReportContext::new(
            format!("RPT_202407{:02}_100000_0000000{}", day, i),
            "regression",
            "staging",
            "Scheduler",
            TriggerType::Scheduled,
            started,
        );
        store.insert_report(&report)?;

        let login = if day <= 6 { TestStatus::Failed } else { TestStatus::Passed };
        let checkout = if day <= 6 { TestStatus::Passed } else { TestStatus::Failed };
        let mut runs = vec![detail("login", login, started), detail("checkout", checkout, started)];
        if day >= 8 {
            runs.push(detail("search", TestStatus::Passed, started));
        }
        for d in &runs {
            report.apply(d.status);
            store.insert_detail(&report.report_id, d)?;
        }
        report.status = ReportStatus::Completed;
        store.update_report(&report)?;
    }
    Ok(())
}

fn engine() -> Result<(AnalyticsEngine, tempfile::TempDir)> {
    let dir = tempfile::tempdir()?;
    let store = SqliteStore::open(dir.path().join("analytics.db").to_str().unwrap())?;
    seed(&store)?;
    Ok((AnalyticsEngine::new(Arc::new(store)), dir))
}

#[tokio::test]
async fn test_summary_over_window() -> Result<()> {
    let (engine, _dir) = engine()?;
    let summary = engine.summary(TimeWindow::last_days(now(), 7)).await;
    assert_eq!(summary.total, 14);
    assert_eq!(summary.passed, 8);
    assert_eq!(summary.failed, 6);
    assert!((summary.pass_rate - 800.0 / 14.0).abs() < 1e-9);
    assert_eq!(summary.p95_duration_ms, 10);

    // window end is exclusive
    let narrow = TimeWindow::new(at(9, 0), at(9, 10));
    assert_eq!(engine.summary(narrow).await.total, 0);
    Ok(())
}

#[tokio::test]
async fn test_daily_trend_is_dense() -> Result<()> {
    let (engine, _dir) = engine()?;
    let daily = engine.daily_trend(TimeWindow::last_days(now(), 7)).await;
    assert_eq!(daily.len(), 7);
    assert_eq!((daily[0].passed, daily[0].failed), (1, 1));
    assert_eq!((daily[5].passed, daily[5].failed), (2, 1));
    assert_eq!((daily[6].passed, daily[6].failed), (0, 0));
    Ok(())
}

#[tokio::test]
async fn test_matrix_classifies_trends() -> Result<()> {
    let (engine, _dir) = engine()?;
    let matrix = engine.test_matrix_at(now(), 7, None, None).await;
    let names: Vec<&str> = matrix.iter().map(|e| e.test_name.as_str()).collect();
    assert_eq!(names, vec!["checkout", "login", "search"]);

    assert_eq!(matrix[0].trend, Trend::Declining);
    assert_eq!(matrix[0].latest.status, TestStatus::Failed);
    assert_eq!(matrix[1].trend, Trend::Improving);
    assert_eq!(matrix[1].pass_rate, 50.0);
    assert_eq!(matrix[2].trend, Trend::Stable);
    assert_eq!(matrix[2].total_runs, 2);

    // status filter applies before grouping
    let failing = engine.test_matrix_at(now(), 7, None, Some(TestStatus::Failed)).await;
    assert_eq!(failing.len(), 2);
    assert!(failing.iter().all(|e| e.pass_rate == 0.0 && e.total_runs == 3));

    let other_suite = engine.test_matrix_at(now(), 7, Some("smoke".into()), None).await;
    assert!(other_suite.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_heatmap_and_top_failures() -> Result<()> {
    let (engine, _dir) = engine()?;
    let heatmap = engine.failure_heatmap_at(now(), 7).await;
    assert_eq!(heatmap.len(), 2);
    assert_eq!(heatmap[0].test_name, "checkout");
    assert_eq!(heatmap[0].daily_failures, vec![0, 0, 0, 1, 1, 1, 0]);
    assert_eq!(heatmap[1].daily_failures, vec![1, 1, 1, 0, 0, 0, 0]);

    let top = engine.top_failures_in(TimeWindow::last_days(now(), 7), 1).await;
    assert_eq!(top.len(), 1);
    // tie on count, most recent failure wins
    assert_eq!(top[0].test_name, "checkout");
    assert_eq!(top[0].failure_count, 3);
    assert_eq!(top[0].last_error.as_deref(), Some("checkout broke"));
    Ok(())
}

#[tokio::test]
async fn test_snapshot_and_exports() -> Result<()> {
    let (engine, _dir) = engine()?;
    let window = TimeWindow::last_days(now(), 7);
    let snap = engine.snapshot(window, 5).await;
    assert_eq!(snap.summary.total, 14);
    assert_eq!(snap.breakdown.total_reports, 6);
    assert_eq!(snap.breakdown.by_status["Completed"], 6);
    assert_eq!(snap.breakdown.by_suite["regression"], 6);
    assert_eq!(snap.top_failures.len(), 2);

    let csv = engine.export_executions(window).await;
    let rows = testmill::analysis::export::parse(&csv, ',');
    assert_eq!(rows.len(), 15);
    assert!(engine.export_summary(window).await.lines().count() >= 2);
    Ok(())
}

#[tokio::test]
async fn test_empty_history_gives_zeros() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = SqliteStore::open(dir.path().join("empty.db").to_str().unwrap())?;
    let engine = AnalyticsEngine::new(Arc::new(store));
    let window = TimeWindow::last_days(now(), 7);

    assert_eq!(engine.summary(window).await, Summary::default());
    assert!(engine.test_matrix_at(now(), 7, None, None).await.is_empty());
    assert!(engine.failure_heatmap_at(now(), 7).await.is_empty());
    assert!(engine.daily_trend(window).await.iter().all(|p| p.passed == 0 && p.failed == 0));
    Ok(())
}

#[tokio::test]
async fn test_storage_outage_degrades_to_empty() -> Result<()> {
    let engine = AnalyticsEngine::new(FlakyStore::offline());
    let window = TimeWindow::last_days(now(), 7);

    assert_eq!(engine.summary(window).await, Summary::default());
    assert!(engine.top_failures_in(window, 10).await.is_empty());
    assert_eq!(engine.breakdown(window).await.total_reports, 0);
    assert_eq!(engine.snapshot(window, 10).await.daily.len(), 7);
    Ok(())
}
