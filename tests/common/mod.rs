//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use testmill::report::{ReportContext, TestDetailRecord, TestStatus};
use testmill::scheduler::ScheduleDefinition;
use testmill::storage::{ExecutionFilter, ExecutionRecord, MemoryStore, ReportFilter, ReportStore};

/// In-memory store whose calls can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// Every call fails.
    pub down: AtomicBool,
    /// Only `update_report` fails.
    pub fail_updates: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offline() -> Arc<Self> {
        let s = Self::default();
        s.down.store(true, Ordering::SeqCst);
        Arc::new(s)
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        Ok(())
    }
}

impl ReportStore for FlakyStore {
    fn insert_report(&self, report: &ReportContext) -> Result<()> {
        self.check()?;
        self.inner.insert_report(report)
    }

    fn update_report(&self, report: &ReportContext) -> Result<()> {
        self.check()?;
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        self.inner.update_report(report)
    }

    fn get_report(&self, report_id: &str) -> Result<Option<ReportContext>> {
        self.check()?;
        self.inner.get_report(report_id)
    }

    fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportContext>> {
        self.check()?;
        self.inner.list_reports(filter)
    }

    fn insert_detail(&self, report_id: &str, detail: &TestDetailRecord) -> Result<()> {
        self.check()?;
        self.inner.insert_detail(report_id, detail)
    }

    fn details_for(&self, report_id: &str) -> Result<Vec<TestDetailRecord>> {
        self.check()?;
        self.inner.details_for(report_id)
    }

    fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        self.check()?;
        self.inner.query_executions(filter)
    }

    fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        self.check()?;
        self.inner.save_schedule(schedule)
    }

    fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        self.check()?;
        self.inner.get_schedule(name)
    }

    fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDefinition>> {
        self.check()?;
        self.inner.list_schedules(active_only)
    }

    fn set_schedule_active(&self, name: &str, active: bool) -> Result<bool> {
        self.check()?;
        self.inner.set_schedule_active(name, active)
    }

    fn record_schedule_run(&self, name: &str, last: DateTime<Utc>, next: Option<DateTime<Utc>>) -> Result<()> {
        self.check()?;
        self.inner.record_schedule_run(name, last, next)
    }

    fn delete_schedule(&self, name: &str) -> Result<bool> {
        self.check()?;
        self.inner.delete_schedule(name)
    }
}

pub fn detail(name: &str, status: TestStatus, at: DateTime<Utc>) -> TestDetailRecord {
    TestDetailRecord {
        test_name: name.to_string(),
        status,
        start_time: at,
        end_time: at,
        duration_ms: 10,
        error_message: status.is_failure().then(|| format!("{} broke", name)),
        artifact_ref: None,
        test_type: "ui".to_string(),
    }
}
