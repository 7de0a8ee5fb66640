//! Report lifecycle manager: open -> accumulate -> finalize.
//!
//! Each open report carries its own mutex, held only while counters are
//! updated. Storage writes and sink rendering happen after the guard is
//! dropped, so a slow disk never stalls the workers feeding the same report.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::sink::ReportSink;
use super::{
    generate_report_id, BatchContext, ReportContext, ReportStatus, TestDetailRecord, TriggerType,
};
use crate::error::{CoreError, CoreResult};
use crate::storage::{run_blocking, ReportFilter, ReportStore};

/// Terminal reports kept in memory so that late calls are answered without a
/// storage round-trip, and so degraded (unpersisted) reports stay queryable.
const CLOSED_CACHE_CAPACITY: usize = 256;

struct ReportState {
    ctx: ReportContext,
    details: Vec<TestDetailRecord>,
    /// Set once finalize has snapshotted the counters; later details are rejected.
    closing: bool,
}

struct OpenReport {
    state: Mutex<ReportState>,
    stop: CancellationToken,
    /// False when storage was unavailable at open time (degraded mode).
    persistent: bool,
}

#[derive(Default)]
struct ClosedReports {
    order: VecDeque<String>,
    reports: HashMap<String, (ReportContext, Vec<TestDetailRecord>)>,
}

impl ClosedReports {
    fn insert(&mut self, ctx: ReportContext, details: Vec<TestDetailRecord>) {
        if self.reports.insert(ctx.report_id.clone(), (ctx.clone(), details)).is_none() {
            self.order.push_back(ctx.report_id);
        }
        while self.order.len() > CLOSED_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.reports.remove(&oldest);
            }
        }
    }
}

pub struct LifecycleManager {
    store: Arc<dyn ReportStore>,
    sink: Option<Arc<dyn ReportSink>>,
    open: RwLock<HashMap<String, Arc<OpenReport>>>,
    closed: Mutex<ClosedReports>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self {
            store,
            sink: None,
            open: RwLock::new(HashMap::new()),
            closed: Mutex::new(ClosedReports::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open a new report in `Running`. Never fails: if storage is unavailable
    /// the report lives in memory only.
    pub async fn open(
        &self,
        suite_type: &str,
        environment: &str,
        created_by: &str,
        trigger_type: TriggerType,
    ) -> BatchContext {
        let now = Utc::now();
        let report_id = generate_report_id(now);
        let ctx = ReportContext::new(report_id.clone(), suite_type, environment, created_by, trigger_type, now);

        let row = ctx.clone();
        let persistent = match run_blocking(&self.store, move |s| s.insert_report(&row)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    report_id = %report_id,
                    error = %e,
                    "Storage unavailable, report running in degraded in-memory mode"
                );
                false
            }
        };

        let stop = CancellationToken::new();
        let entry = Arc::new(OpenReport {
            state: Mutex::new(ReportState {
                ctx,
                details: Vec::new(),
                closing: false,
            }),
            stop: stop.clone(),
            persistent,
        });
        self.open.write().await.insert(report_id.clone(), entry);

        info!(report_id = %report_id, suite = %suite_type, trigger = %trigger_type, "Report opened");
        BatchContext::new(report_id, suite_type, environment, stop)
    }

    async fn open_entry(&self, report_id: &str) -> Option<Arc<OpenReport>> {
        self.open.read().await.get(report_id).cloned()
    }

    /// Status of a report that is not open: from the closed cache, then storage.
    async fn status_elsewhere(&self, report_id: &str) -> CoreResult<ReportContext> {
        if let Some((ctx, _)) = self.closed.lock().await.reports.get(report_id) {
            return Ok(ctx.clone());
        }
        let id = report_id.to_string();
        run_blocking(&self.store, move |s| s.get_report(&id))
            .await
            .map_err(CoreError::persistence)?
            .ok_or_else(|| CoreError::ReportNotFound(report_id.to_string()))
    }

    async fn close(&self, report_id: &str, ctx: ReportContext, details: Vec<TestDetailRecord>) {
        self.closed.lock().await.insert(ctx, details);
        self.open.write().await.remove(report_id);
    }

    /// Count one finished test case against a running report.
    pub async fn record_detail(&self, report_id: &str, detail: TestDetailRecord) -> CoreResult<()> {
        let Some(entry) = self.open_entry(report_id).await else {
            let ctx = self.status_elsewhere(report_id).await?;
            warn!(
                report_id = %report_id,
                test = %detail.test_name,
                status = %ctx.status,
                "Rejected detail for report that is no longer running"
            );
            return Err(CoreError::NotRunning {
                report_id: report_id.to_string(),
                status: ctx.status,
            });
        };

        {
            let mut state = entry.state.lock().await;
            if state.ctx.status.is_terminal() || state.closing {
                let status = state.ctx.status;
                drop(state);
                warn!(
                    report_id = %report_id,
                    test = %detail.test_name,
                    status = %status,
                    "Rejected detail for report that is no longer running"
                );
                return Err(CoreError::NotRunning {
                    report_id: report_id.to_string(),
                    status,
                });
            }
            state.ctx.apply(detail.status);
            state.details.push(detail.clone());
        }

        if entry.persistent {
            let id = report_id.to_string();
            let name = detail.test_name.clone();
            if let Err(e) = run_blocking(&self.store, move |s| s.insert_detail(&id, &detail)).await {
                warn!(report_id = %report_id, test = %name, error = %e, "Failed to persist test detail");
            }
        }
        Ok(())
    }

    /// Move a running report to `Completed`, or `Failed` if the final state
    /// cannot be persisted. Finalizing a terminal report returns it unchanged.
    pub async fn finalize(&self, report_id: &str) -> CoreResult<ReportContext> {
        let Some(entry) = self.open_entry(report_id).await else {
            let ctx = self.status_elsewhere(report_id).await?;
            if ctx.status.is_terminal() {
                return Ok(ctx);
            }
            // Running in storage but not owned here: left over from another process.
            return Err(CoreError::ReportNotFound(report_id.to_string()));
        };

        let (mut snapshot, details) = {
            let mut state = entry.state.lock().await;
            if state.ctx.status.is_terminal() || state.closing {
                return Ok(state.ctx.clone());
            }
            state.closing = true;

            let now = Utc::now();
            let mut snapshot = state.ctx.clone();
            snapshot.status = ReportStatus::Completed;
            snapshot.finished_at = Some(now);
            snapshot.duration_ms = Some((now - snapshot.started_at).num_milliseconds().max(0) as u64);
            (snapshot, state.details.clone())
        };

        if let Some(sink) = &self.sink {
            let sink = sink.clone();
            let (report, rows) = (snapshot.clone(), details.clone());
            match tokio::task::spawn_blocking(move || sink.publish(&report, &rows)).await {
                Ok(Ok(path)) => snapshot.report_path = Some(path),
                Ok(Err(e)) => warn!(report_id = %report_id, error = %e, "Report rendering failed"),
                Err(e) => warn!(report_id = %report_id, error = %e, "Report rendering task failed"),
            }
        }

        if entry.persistent {
            let row = snapshot.clone();
            if let Err(e) = run_blocking(&self.store, move |s| s.update_report(&row)).await {
                error!(report_id = %report_id, error = %e, "Failed to persist final report state");
                snapshot.status = ReportStatus::Failed;
                snapshot.message = Some(format!("failed to persist final state: {}", e));

                let row = snapshot.clone();
                if let Err(e) = run_blocking(&self.store, move |s| s.update_report(&row)).await {
                    warn!(report_id = %report_id, error = %e, "Could not record Failed status either");
                }
            }
        }

        entry.state.lock().await.ctx = snapshot.clone();
        self.close(report_id, snapshot.clone(), details).await;

        info!(
            report_id = %report_id,
            status = %snapshot.status,
            total = snapshot.total_tests,
            passed = snapshot.passed_tests,
            failed = snapshot.failed_tests,
            skipped = snapshot.skipped_tests,
            "Report finalized"
        );
        Ok(snapshot)
    }

    /// Move a running report to `Stopped`. Dispatch of new tests ceases;
    /// tests already running are not interrupted.
    pub async fn stop(&self, report_id: &str, reason: &str) -> CoreResult<ReportContext> {
        let ctx = self.terminate(report_id, ReportStatus::Stopped, reason).await?;
        info!(report_id = %report_id, reason = %reason, "Report stopped");
        Ok(ctx)
    }

    /// Move a running report straight to `Failed`, e.g. when its suite
    /// could not be resolved.
    pub async fn fail(&self, report_id: &str, reason: &str) -> CoreResult<ReportContext> {
        let ctx = self.terminate(report_id, ReportStatus::Failed, reason).await?;
        warn!(report_id = %report_id, reason = %reason, "Report failed");
        Ok(ctx)
    }

    async fn terminate(
        &self,
        report_id: &str,
        status: ReportStatus,
        reason: &str,
    ) -> CoreResult<ReportContext> {
        let Some(entry) = self.open_entry(report_id).await else {
            let ctx = self.status_elsewhere(report_id).await?;
            return Err(CoreError::NotRunning {
                report_id: report_id.to_string(),
                status: ctx.status,
            });
        };

        let (snapshot, details) = {
            let mut state = entry.state.lock().await;
            if state.ctx.status.is_terminal() || state.closing {
                return Err(CoreError::NotRunning {
                    report_id: report_id.to_string(),
                    status: state.ctx.status,
                });
            }
            let now = Utc::now();
            state.ctx.status = status;
            state.ctx.finished_at = Some(now);
            state.ctx.duration_ms = Some((now - state.ctx.started_at).num_milliseconds().max(0) as u64);
            state.ctx.message = Some(reason.to_string());
            (state.ctx.clone(), state.details.clone())
        };
        entry.stop.cancel();

        if entry.persistent {
            let row = snapshot.clone();
            if let Err(e) = run_blocking(&self.store, move |s| s.update_report(&row)).await {
                warn!(report_id = %report_id, status = %status, error = %e, "Failed to persist terminal status");
            }
        }
        self.close(report_id, snapshot.clone(), details).await;
        Ok(snapshot)
    }

    /// Current view of a report: live for open ones, stored for the rest.
    pub async fn get(&self, report_id: &str) -> CoreResult<ReportContext> {
        if let Some(entry) = self.open_entry(report_id).await {
            return Ok(entry.state.lock().await.ctx.clone());
        }
        self.status_elsewhere(report_id).await
    }

    pub async fn details(&self, report_id: &str) -> CoreResult<Vec<TestDetailRecord>> {
        if let Some(entry) = self.open_entry(report_id).await {
            return Ok(entry.state.lock().await.details.clone());
        }
        if let Some((_, details)) = self.closed.lock().await.reports.get(report_id) {
            return Ok(details.clone());
        }
        let id = report_id.to_string();
        let (report, details) = run_blocking(&self.store, move |s| {
            Ok((s.get_report(&id)?, s.details_for(&id)?))
        })
        .await
        .map_err(CoreError::persistence)?;
        match report {
            Some(_) => Ok(details),
            None => Err(CoreError::ReportNotFound(report_id.to_string())),
        }
    }

    /// Stored reports matching `filter`, newest first.
    pub async fn list(&self, filter: ReportFilter) -> CoreResult<Vec<ReportContext>> {
        run_blocking(&self.store, move |s| s.list_reports(&filter))
            .await
            .map_err(CoreError::persistence)
    }

    /// Snapshots of every report currently running.
    pub async fn running(&self) -> Vec<ReportContext> {
        let entries: Vec<Arc<OpenReport>> = self.open.read().await.values().cloned().collect();
        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            list.push(entry.state.lock().await.ctx.clone());
        }
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }
}
