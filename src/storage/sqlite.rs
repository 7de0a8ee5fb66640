//! SQLite implementation of the `ReportStore` port.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, ts, ExecutionFilter, ExecutionRecord, Pool, ReportFilter, ReportStore};
use crate::report::{ReportContext, TestDetailRecord};
use crate::scheduler::ScheduleDefinition;

const REPORT_COLUMNS: &str = "report_id, suite_type, environment, status, total_tests, passed_tests,
     failed_tests, skipped_tests, success_rate, started_at, finished_at, duration_ms,
     created_by, trigger_type, report_path, message";

const SCHEDULE_COLUMNS: &str =
    "name, cron_expr, target_suite, environment, parallelism, enabled, last_run_at, next_run_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(super::open_pool(path)?))
    }
}

/// Map a text column through `FromStr`, surfacing bad values as conversion errors.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ReportContext> {
    Ok(ReportContext {
        report_id: row.get(0)?,
        suite_type: row.get(1)?,
        environment: row.get(2)?,
        status: parse_col(row, 3)?,
        total_tests: row.get::<_, i64>(4)? as u64,
        passed_tests: row.get::<_, i64>(5)? as u64,
        failed_tests: row.get::<_, i64>(6)? as u64,
        skipped_tests: row.get::<_, i64>(7)? as u64,
        success_rate: row.get(8)?,
        started_at: ts_col(row, 9)?,
        finished_at: opt_ts_col(row, 10)?,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|d| d as u64),
        created_by: row.get(12)?,
        trigger_type: parse_col(row, 13)?,
        report_path: row.get(14)?,
        message: row.get(15)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleDefinition> {
    Ok(ScheduleDefinition {
        schedule_name: row.get(0)?,
        cron_expression: row.get(1)?,
        target_suite: row.get(2)?,
        environment: row.get(3)?,
        parallelism: row.get::<_, i64>(4)? as usize,
        is_active: row.get::<_, i64>(5)? != 0,
        last_execution: opt_ts_col(row, 6)?,
        next_execution: opt_ts_col(row, 7)?,
    })
}

impl ReportStore for SqliteStore {
    fn insert_report(&self, r: &ReportContext) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO reports ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                REPORT_COLUMNS
            ),
            params![
                r.report_id,
                r.suite_type,
                r.environment,
                r.status.as_str(),
                r.total_tests as i64,
                r.passed_tests as i64,
                r.failed_tests as i64,
                r.skipped_tests as i64,
                r.success_rate,
                ts(&r.started_at),
                r.finished_at.as_ref().map(ts),
                r.duration_ms.map(|d| d as i64),
                r.created_by,
                r.trigger_type.as_str(),
                r.report_path,
                r.message,
            ],
        )
        .context("Failed to insert report")?;
        Ok(())
    }

    fn update_report(&self, r: &ReportContext) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE reports SET status = ?2, total_tests = ?3, passed_tests = ?4,
                    failed_tests = ?5, skipped_tests = ?6, success_rate = ?7,
                    finished_at = ?8, duration_ms = ?9, report_path = ?10, message = ?11
                 WHERE report_id = ?1",
                params![
                    r.report_id,
                    r.status.as_str(),
                    r.total_tests as i64,
                    r.passed_tests as i64,
                    r.failed_tests as i64,
                    r.skipped_tests as i64,
                    r.success_rate,
                    r.finished_at.as_ref().map(ts),
                    r.duration_ms.map(|d| d as i64),
                    r.report_path,
                    r.message,
                ],
            )
            .context("Failed to update report")?;
        if changed == 0 {
            anyhow::bail!("Report '{}' not found", r.report_id);
        }
        Ok(())
    }

    fn get_report(&self, report_id: &str) -> Result<Option<ReportContext>> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                &format!("SELECT {} FROM reports WHERE report_id = ?1", REPORT_COLUMNS),
                params![report_id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportContext>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM reports
             WHERE (?1 IS NULL OR started_at >= ?1)
               AND (?2 IS NULL OR started_at < ?2)
               AND (?3 IS NULL OR status = ?3)
               AND (?4 IS NULL OR suite_type = ?4)
             ORDER BY started_at DESC
             LIMIT ?5",
            REPORT_COLUMNS
        ))?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.from.as_ref().map(ts),
                filter.to.as_ref().map(ts),
                filter.status.map(|s| s.as_str()),
                filter.suite,
                limit,
            ],
            report_from_row,
        )?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn insert_detail(&self, report_id: &str, d: &TestDetailRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_details (report_id, test_name, status, start_time, end_time,
                duration_ms, error_message, artifact_ref, test_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report_id,
                d.test_name,
                d.status.as_str(),
                ts(&d.start_time),
                ts(&d.end_time),
                d.duration_ms as i64,
                d.error_message,
                d.artifact_ref,
                d.test_type,
            ],
        )
        .context("Failed to insert test detail")?;
        Ok(())
    }

    fn details_for(&self, report_id: &str) -> Result<Vec<TestDetailRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT test_name, status, start_time, end_time, duration_ms, error_message,
                    artifact_ref, test_type
             FROM test_details WHERE report_id = ?1 ORDER BY start_time ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![report_id], |row| {
            Ok(TestDetailRecord {
                test_name: row.get(0)?,
                status: parse_col(row, 1)?,
                start_time: ts_col(row, 2)?,
                end_time: ts_col(row, 3)?,
                duration_ms: row.get::<_, i64>(4)? as u64,
                error_message: row.get(5)?,
                artifact_ref: row.get(6)?,
                test_type: row.get(7)?,
            })
        })?;

        let mut details = Vec::new();
        for r in rows {
            details.push(r?);
        }
        Ok(details)
    }

    fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT d.report_id, r.suite_type, r.environment, d.test_name, d.test_type,
                    d.status, d.duration_ms, d.error_message, d.start_time
             FROM test_details d JOIN reports r ON r.report_id = d.report_id
             WHERE d.start_time >= ?1 AND d.start_time < ?2
               AND (?3 IS NULL OR r.suite_type = ?3)
               AND (?4 IS NULL OR d.status = ?4)
             ORDER BY d.start_time ASC, d.id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                ts(&filter.from),
                ts(&filter.to),
                filter.suite,
                filter.status.map(|s| s.as_str()),
            ],
            |row| {
                Ok(ExecutionRecord {
                    report_id: row.get(0)?,
                    suite_type: row.get(1)?,
                    environment: row.get(2)?,
                    test_name: row.get(3)?,
                    test_type: row.get(4)?,
                    status: parse_col(row, 5)?,
                    duration_ms: row.get::<_, i64>(6)? as u64,
                    error_message: row.get(7)?,
                    timestamp: ts_col(row, 8)?,
                })
            },
        )?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    fn save_schedule(&self, s: &ScheduleDefinition) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (name, cron_expr, target_suite, environment, parallelism,
                enabled, last_run_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                cron_expr = excluded.cron_expr,
                target_suite = excluded.target_suite,
                environment = excluded.environment,
                parallelism = excluded.parallelism,
                enabled = excluded.enabled,
                last_run_at = excluded.last_run_at,
                next_run_at = excluded.next_run_at,
                updated_at = datetime('now')",
            params![
                s.schedule_name,
                s.cron_expression,
                s.target_suite,
                s.environment,
                s.parallelism as i64,
                s.is_active as i64,
                s.last_execution.as_ref().map(ts),
                s.next_execution.as_ref().map(ts),
            ],
        )
        .context("Failed to save schedule")?;
        Ok(())
    }

    fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        let conn = self.pool.get()?;
        let schedule = conn
            .query_row(
                &format!("SELECT {} FROM schedules WHERE name = ?1", SCHEDULE_COLUMNS),
                params![name],
                schedule_from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules WHERE (?1 = 0 OR enabled = 1) ORDER BY name",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![active_only as i64], schedule_from_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn set_schedule_active(&self, name: &str, active: bool) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules SET enabled = ?2, updated_at = datetime('now') WHERE name = ?1",
            params![name, active as i64],
        )?;
        Ok(changed > 0)
    }

    fn record_schedule_run(
        &self,
        name: &str,
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3, updated_at = datetime('now')
             WHERE name = ?1",
            params![name, ts(&last), next.as_ref().map(ts)],
        )
        .context("Failed to update last_run")?;
        Ok(())
    }

    fn delete_schedule(&self, name: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM schedules WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ReportStatus, TestStatus, TriggerType};
    use chrono::Duration;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn detail(name: &str, status: TestStatus, at: DateTime<Utc>) -> TestDetailRecord {
        TestDetailRecord {
            test_name: name.to_string(),
            status,
            start_time: at,
            end_time: at + Duration::milliseconds(40),
            duration_ms: 40,
            error_message: status.is_failure().then(|| "boom".to_string()),
            artifact_ref: None,
            test_type: "api".to_string(),
        }
    }

    #[test]
    fn test_report_round_trip_and_update() -> Result<()> {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let mut report = ReportContext::new("RPT_1".into(), "smoke", "qa", "tester", TriggerType::Manual, now);
        store.insert_report(&report)?;

        report.apply(TestStatus::Passed);
        report.status = ReportStatus::Completed;
        report.finished_at = Some(now + Duration::seconds(2));
        report.duration_ms = Some(2000);
        store.update_report(&report)?;

        let loaded = store.get_report("RPT_1")?.expect("report stored");
        assert_eq!(loaded.status, ReportStatus::Completed);
        assert_eq!(loaded.total_tests, 1);
        assert_eq!(loaded.duration_ms, Some(2000));
        assert_eq!(loaded.trigger_type, TriggerType::Manual);
        assert!(store.get_report("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_missing_report_errors() {
        let (_dir, store) = temp_store();
        let report = ReportContext::new("nope".into(), "smoke", "", "t", TriggerType::Api, Utc::now());
        assert!(store.update_report(&report).is_err());
    }

    #[test]
    fn test_query_executions_window_and_filters() -> Result<()> {
        let (_dir, store) = temp_store();
        let base = Utc::now() - Duration::hours(5);
        let report = ReportContext::new("RPT_A".into(), "smoke", "staging", "t", TriggerType::Scheduled, base);
        store.insert_report(&report)?;
        store.insert_detail("RPT_A", &detail("login", TestStatus::Passed, base))?;
        store.insert_detail("RPT_A", &detail("logout", TestStatus::Failed, base + Duration::hours(1)))?;
        store.insert_detail("RPT_A", &detail("search", TestStatus::Passed, base + Duration::hours(3)))?;

        let all = store.query_executions(&ExecutionFilter::window(base, base + Duration::hours(3)))?;
        assert_eq!(all.len(), 2, "upper bound is exclusive");
        assert_eq!(all[0].test_name, "login");
        assert_eq!(all[0].environment, "staging");

        let mut failed_only = ExecutionFilter::window(base, base + Duration::hours(4));
        failed_only.status = Some(TestStatus::Failed);
        let failed = store.query_executions(&failed_only)?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));

        let mut other_suite = ExecutionFilter::window(base, base + Duration::hours(4));
        other_suite.suite = Some("regression".into());
        assert!(store.query_executions(&other_suite)?.is_empty());

        assert_eq!(store.details_for("RPT_A")?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_schedule_crud() -> Result<()> {
        let (_dir, store) = temp_store();
        let mut def = ScheduleDefinition::new("nightly", "0 0 2 * * *", "regression");
        store.save_schedule(&def)?;

        def.parallelism = 8;
        store.save_schedule(&def)?;
        let loaded = store.get_schedule("nightly")?.expect("saved");
        assert_eq!(loaded.parallelism, 8);
        assert!(loaded.is_active);

        let now = Utc::now();
        store.record_schedule_run("nightly", now, Some(now + Duration::days(1)))?;
        let loaded = store.get_schedule("nightly")?.expect("saved");
        assert!(loaded.last_execution.is_some());

        assert!(store.set_schedule_active("nightly", false)?);
        assert!(store.list_schedules(true)?.is_empty());
        assert_eq!(store.list_schedules(false)?.len(), 1);
        assert!(!store.set_schedule_active("ghost", true)?);

        assert!(store.delete_schedule("nightly")?);
        assert!(!store.delete_schedule("nightly")?);
        Ok(())
    }

    #[test]
    fn test_list_reports_newest_first_with_limit() -> Result<()> {
        let (_dir, store) = temp_store();
        let base = Utc::now() - Duration::hours(3);
        for i in 0..3 {
            let r = ReportContext::new(
                format!("RPT_{}", i),
                "smoke",
                "",
                "t",
                TriggerType::Manual,
                base + Duration::hours(i),
            );
            store.insert_report(&r)?;
        }
        let filter = ReportFilter { limit: Some(2), ..Default::default() };
        let list = store.list_reports(&filter)?;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].report_id, "RPT_2");
        Ok(())
    }
}
