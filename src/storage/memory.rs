//! In-process `ReportStore`, used for ephemeral runs that should leave no
//! database behind.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{ExecutionFilter, ExecutionRecord, ReportFilter, ReportStore};
use crate::report::{ReportContext, TestDetailRecord};
use crate::scheduler::ScheduleDefinition;

#[derive(Default)]
struct Tables {
    reports: HashMap<String, ReportContext>,
    details: HashMap<String, Vec<TestDetailRecord>>,
    schedules: HashMap<String, ScheduleDefinition>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

impl ReportStore for MemoryStore {
    fn insert_report(&self, report: &ReportContext) -> Result<()> {
        let mut t = self.lock()?;
        if t.reports.contains_key(&report.report_id) {
            anyhow::bail!("Report '{}' already exists", report.report_id);
        }
        t.reports.insert(report.report_id.clone(), report.clone());
        Ok(())
    }

    fn update_report(&self, report: &ReportContext) -> Result<()> {
        let mut t = self.lock()?;
        match t.reports.get_mut(&report.report_id) {
            Some(slot) => {
                *slot = report.clone();
                Ok(())
            }
            None => anyhow::bail!("Report '{}' not found", report.report_id),
        }
    }

    fn get_report(&self, report_id: &str) -> Result<Option<ReportContext>> {
        Ok(self.lock()?.reports.get(report_id).cloned())
    }

    fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportContext>> {
        let t = self.lock()?;
        let mut list: Vec<ReportContext> =
            t.reports.values().filter(|r| filter.matches(r)).cloned().collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            list.truncate(limit);
        }
        Ok(list)
    }

    fn insert_detail(&self, report_id: &str, detail: &TestDetailRecord) -> Result<()> {
        let mut t = self.lock()?;
        if !t.reports.contains_key(report_id) {
            anyhow::bail!("Report '{}' not found", report_id);
        }
        t.details.entry(report_id.to_string()).or_default().push(detail.clone());
        Ok(())
    }

    fn details_for(&self, report_id: &str) -> Result<Vec<TestDetailRecord>> {
        let t = self.lock()?;
        let mut details = t.details.get(report_id).cloned().unwrap_or_default();
        details.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(details)
    }

    fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let t = self.lock()?;
        let mut records = Vec::new();
        for (report_id, details) in &t.details {
            let Some(report) = t.reports.get(report_id) else { continue };
            for d in details {
                let record = ExecutionRecord {
                    report_id: report_id.clone(),
                    suite_type: report.suite_type.clone(),
                    environment: report.environment.clone(),
                    test_name: d.test_name.clone(),
                    test_type: d.test_type.clone(),
                    status: d.status,
                    duration_ms: d.duration_ms,
                    error_message: d.error_message.clone(),
                    timestamp: d.start_time,
                };
                if filter.matches(&record) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        self.lock()?
            .schedules
            .insert(schedule.schedule_name.clone(), schedule.clone());
        Ok(())
    }

    fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        Ok(self.lock()?.schedules.get(name).cloned())
    }

    fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDefinition>> {
        let t = self.lock()?;
        let mut list: Vec<ScheduleDefinition> = t
            .schedules
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
        Ok(list)
    }

    fn set_schedule_active(&self, name: &str, active: bool) -> Result<bool> {
        let mut t = self.lock()?;
        Ok(match t.schedules.get_mut(name) {
            Some(s) => {
                s.is_active = active;
                true
            }
            None => false,
        })
    }

    fn record_schedule_run(
        &self,
        name: &str,
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut t = self.lock()?;
        if let Some(s) = t.schedules.get_mut(name) {
            s.last_execution = Some(last);
            s.next_execution = next;
        }
        Ok(())
    }

    fn delete_schedule(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.schedules.remove(name).is_some())
    }
}
