//! Scheduled execution orchestrator.
//!
//! Bridges schedule definitions to the trigger engine, and each fire to the
//! lifecycle manager and the test runner. A job key never has two batches in
//! flight: a fire that arrives while the previous batch is still running is
//! skipped, not queued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::cron::{preview_runs, PlannedRun};
use super::trigger::{FireCallback, TriggerEngine};
use super::{job_key_for, CronExpr, ScheduleDefinition};
use crate::error::{CoreError, CoreResult};
use crate::report::{BatchContext, LifecycleManager, ReportContext, TestDetailRecord, TestStatus, TriggerType};
use crate::runner::{TestCaseRef, TestOutcome, TestRunner};
use crate::storage::{run_blocking, ReportStore};

pub const SCHEDULER_USER: &str = "Scheduler";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum time to wait for a batch's dispatched tests before finalizing anyway.
    pub batch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
pub enum FireOutcome {
    /// The batch ran; carries the terminal report.
    Ran(ReportContext),
    /// The previous batch of this job is still running.
    Skipped,
    /// Nothing is registered under the job key.
    NotRegistered,
    /// The stored definition was deactivated or deleted outside this
    /// process; the live trigger has been retired.
    Inactive,
    /// The batch ran but its report could not be closed.
    Failed(String),
}

/// Result of loading persisted schedules at start-up.
#[derive(Debug, Default, Serialize)]
pub struct StartupReport {
    pub registered: Vec<String>,
    /// `(schedule name, error)` for every schedule that could not be registered.
    pub failed: Vec<(String, String)>,
}

struct Inner {
    store: Arc<dyn ReportStore>,
    lifecycle: Arc<LifecycleManager>,
    runner: Arc<dyn TestRunner>,
    trigger: Arc<dyn TriggerEngine>,
    config: OrchestratorConfig,
    /// Live definitions keyed by job key.
    registered: Mutex<HashMap<String, ScheduleDefinition>>,
    /// Job keys with a batch in progress.
    in_flight: Mutex<HashSet<String>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Guarded maps hold plain values; a poisoned lock leaves them consistent.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a job key as running for as long as it lives.
struct InFlight {
    inner: Arc<Inner>,
    job_key: String,
}

impl InFlight {
    fn acquire(inner: &Arc<Inner>, job_key: &str) -> Option<Self> {
        if !guard(&inner.in_flight).insert(job_key.to_string()) {
            return None;
        }
        Some(Self {
            inner: inner.clone(),
            job_key: job_key.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        guard(&self.inner.in_flight).remove(&self.job_key);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ReportStore>,
        lifecycle: Arc<LifecycleManager>,
        runner: Arc<dyn TestRunner>,
        trigger: Arc<dyn TriggerEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                lifecycle,
                runner,
                trigger,
                config,
                registered: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.inner.lifecycle
    }

    /// The trigger engine holds callbacks; a weak handle keeps it from
    /// owning the orchestrator.
    fn callback_for(&self, job_key: String) -> FireCallback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            let job_key = job_key.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Orchestrator { inner }.fire(&job_key).await;
                }
            }
            .boxed()
        })
    }

    /// Validate, register with the trigger engine and persist as active.
    /// Invalid definitions are rejected before any side effect.
    pub async fn register(&self, def: ScheduleDefinition) -> CoreResult<ScheduleDefinition> {
        let cron = def.validate()?;
        let job_key = def.job_key();

        let mut def = def;
        def.is_active = true;
        def.next_execution = cron.next_after(&Utc::now());

        self.inner
            .trigger
            .register(&job_key, &cron, self.callback_for(job_key.clone()))?;
        guard(&self.inner.registered).insert(job_key, def.clone());

        let row = def.clone();
        if let Err(e) = run_blocking(&self.inner.store, move |s| s.save_schedule(&row)).await {
            warn!(schedule = %def.schedule_name, error = %e, "Schedule registered but not persisted");
        }

        info!(
            schedule = %def.schedule_name,
            cron = %def.cron_expression,
            suite = %def.target_suite,
            next = ?def.next_execution,
            "Schedule registered"
        );
        Ok(def)
    }

    /// Deregister the live trigger and mark the schedule inactive. Unknown or
    /// already-deregistered schedules are a no-op.
    pub async fn unregister(&self, schedule_name: &str) -> CoreResult<()> {
        let job_key = job_key_for(schedule_name);
        let was_live = self.inner.trigger.unregister(&job_key);
        guard(&self.inner.registered).remove(&job_key);
        if !was_live {
            debug!(schedule = %schedule_name, "Schedule was not registered");
        }

        let name = schedule_name.to_string();
        if let Err(e) = run_blocking(&self.inner.store, move |s| s.set_schedule_active(&name, false)).await {
            warn!(schedule = %schedule_name, error = %e, "Failed to persist schedule deactivation");
        }
        Ok(())
    }

    /// Replace a schedule's trigger. The new definition is validated first so
    /// a bad update leaves the old trigger in place.
    pub async fn reschedule(&self, def: ScheduleDefinition) -> CoreResult<ScheduleDefinition> {
        def.validate()?;
        self.unregister(&def.schedule_name).await?;
        self.register(def).await
    }

    /// Register a persisted schedule again.
    pub async fn activate(&self, schedule_name: &str) -> CoreResult<ScheduleDefinition> {
        let name = schedule_name.to_string();
        let def = run_blocking(&self.inner.store, move |s| s.get_schedule(&name))
            .await
            .map_err(CoreError::persistence)?
            .ok_or_else(|| CoreError::ScheduleNotFound(schedule_name.to_string()))?;
        self.register(def).await
    }

    pub async fn deactivate(&self, schedule_name: &str) -> CoreResult<()> {
        self.unregister(schedule_name).await
    }

    /// Deregister and delete a schedule.
    pub async fn remove(&self, schedule_name: &str) -> CoreResult<()> {
        self.unregister(schedule_name).await?;
        let name = schedule_name.to_string();
        let existed = run_blocking(&self.inner.store, move |s| s.delete_schedule(&name))
            .await
            .map_err(CoreError::persistence)?;
        if !existed {
            return Err(CoreError::ScheduleNotFound(schedule_name.to_string()));
        }
        info!(schedule = %schedule_name, "Schedule removed");
        Ok(())
    }

    /// Load every active schedule from storage and register it. One bad
    /// schedule does not keep the others from registering; if the trigger
    /// engine rejects all of them the engine itself is considered down.
    pub async fn start(&self) -> CoreResult<StartupReport> {
        let defs = run_blocking(&self.inner.store, |s| s.list_schedules(true))
            .await
            .map_err(CoreError::persistence)?;

        let mut report = StartupReport::default();
        let mut engine_failures = 0usize;
        for def in defs {
            let name = def.schedule_name.clone();
            match self.register(def).await {
                Ok(_) => report.registered.push(name),
                Err(e) => {
                    warn!(schedule = %name, error = %e, "Failed to register schedule at start-up");
                    if matches!(e, CoreError::TriggerEngine { .. }) {
                        engine_failures += 1;
                    }
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        if report.registered.is_empty() && engine_failures > 0 && engine_failures == report.failed.len() {
            return Err(CoreError::TriggerEngine {
                job_key: "*".to_string(),
                reason: format!("trigger engine rejected all {} schedules", engine_failures),
            });
        }

        info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "Scheduler started"
        );
        Ok(report)
    }

    /// Upsert schedules declared in configuration. Existing schedules keep
    /// their active flag and run history. Invalid entries are skipped.
    pub async fn seed(&self, defs: &[ScheduleDefinition]) -> usize {
        let mut seeded = 0;
        for def in defs {
            if let Err(e) = def.validate() {
                warn!(schedule = %def.schedule_name, error = %e, "Skipping invalid configured schedule");
                continue;
            }
            let mut def = def.clone();
            let result = run_blocking(&self.inner.store, move |s| {
                if let Some(existing) = s.get_schedule(&def.schedule_name)? {
                    def.is_active = existing.is_active;
                    def.last_execution = existing.last_execution;
                    def.next_execution = existing.next_execution;
                }
                s.save_schedule(&def)
            })
            .await;
            match result {
                Ok(()) => seeded += 1,
                Err(e) => warn!(error = %e, "Failed to seed configured schedule"),
            }
        }
        seeded
    }

    /// All persisted schedules; falls back to the live set if storage is down.
    pub async fn schedules(&self) -> Vec<ScheduleDefinition> {
        match run_blocking(&self.inner.store, |s| s.list_schedules(false)).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Schedule store unavailable, listing live schedules only");
                let mut live: Vec<_> = guard(&self.inner.registered).values().cloned().collect();
                live.sort_by(|a, b| a.schedule_name.cmp(&b.schedule_name));
                live
            }
        }
    }

    /// Live definition for a schedule, if registered.
    pub fn registered(&self, schedule_name: &str) -> Option<ScheduleDefinition> {
        guard(&self.inner.registered).get(&job_key_for(schedule_name)).cloned()
    }

    /// Upcoming firings of the live schedules over the next `hours`.
    pub fn preview(&self, hours: u64) -> Vec<PlannedRun> {
        let defs: Vec<_> = guard(&self.inner.registered).values().cloned().collect();
        preview_runs(&defs, Utc::now(), hours)
    }

    /// Handle one trigger. Returns immediately with `Skipped` if this job's
    /// previous batch is still running; `lastExecution` is then left alone.
    /// A schedule disabled in storage by another process is retired here
    /// instead of run.
    pub async fn fire(&self, job_key: &str) -> FireOutcome {
        let Some(def) = guard(&self.inner.registered).get(job_key).cloned() else {
            warn!(job = %job_key, "Fire for unregistered job ignored");
            return FireOutcome::NotRegistered;
        };

        let name = def.schedule_name.clone();
        match run_blocking(&self.inner.store, move |s| s.get_schedule(&name)).await {
            Ok(Some(stored)) if stored.is_active => {}
            Ok(_) => {
                info!(schedule = %def.schedule_name, "Schedule no longer active in storage, retiring trigger");
                self.inner.trigger.unregister(job_key);
                guard(&self.inner.registered).remove(job_key);
                return FireOutcome::Inactive;
            }
            Err(e) => {
                debug!(schedule = %def.schedule_name, error = %e, "Schedule store unavailable, firing live definition");
            }
        }

        let Some(_running) = InFlight::acquire(&self.inner, job_key) else {
            warn!(schedule = %def.schedule_name, "Previous batch still running, skipping this fire");
            return FireOutcome::Skipped;
        };

        let now = Utc::now();
        let next = CronExpr::parse(&def.cron_expression)
            .ok()
            .and_then(|c| c.next_after(&now));
        if let Some(live) = guard(&self.inner.registered).get_mut(job_key) {
            live.last_execution = Some(now);
            live.next_execution = next;
        }
        let name = def.schedule_name.clone();
        if let Err(e) = run_blocking(&self.inner.store, move |s| s.record_schedule_run(&name, now, next)).await {
            warn!(schedule = %def.schedule_name, error = %e, "Failed to update last_run");
        }

        info!(schedule = %def.schedule_name, suite = %def.target_suite, "Schedule fired");
        match self
            .run_suite(
                &def.target_suite,
                &def.environment,
                def.parallelism,
                SCHEDULER_USER,
                TriggerType::Scheduled,
            )
            .await
        {
            Ok(report) => FireOutcome::Ran(report),
            Err(e) => {
                warn!(schedule = %def.schedule_name, error = %e, "Scheduled batch ended without a report");
                FireOutcome::Failed(e.to_string())
            }
        }
    }

    /// Open a report, dispatch every case of `suite` with at most
    /// `parallelism` in flight, then finalize.
    pub async fn run_suite(
        &self,
        suite: &str,
        environment: &str,
        parallelism: usize,
        created_by: &str,
        trigger_type: TriggerType,
    ) -> CoreResult<ReportContext> {
        let batch = self
            .inner
            .lifecycle
            .open(suite, environment, created_by, trigger_type)
            .await;

        let cases = match self.inner.runner.cases(suite).await {
            Ok(cases) => cases,
            Err(e) => {
                return self
                    .inner
                    .lifecycle
                    .fail(&batch.report_id, &format!("could not resolve suite '{}': {:#}", suite, e))
                    .await;
            }
        };

        self.dispatch(&batch, cases, parallelism).await;
        self.inner.lifecycle.finalize(&batch.report_id).await
    }

    async fn dispatch(&self, batch: &BatchContext, cases: Vec<TestCaseRef>, parallelism: usize) {
        let limit = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut workers = JoinSet::new();

        for case in cases {
            let permit = tokio::select! {
                biased;
                _ = batch.stopped() => break,
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            if batch.is_stopped() {
                break;
            }

            let runner = self.inner.runner.clone();
            let lifecycle = self.inner.lifecycle.clone();
            let batch = batch.clone();
            workers.spawn(async move {
                let _permit = permit;
                run_case(runner.as_ref(), &lifecycle, &batch, case).await;
            });
        }

        if batch.is_stopped() {
            info!(report_id = %batch.report_id, "Batch stopped, no further tests dispatched");
        }

        let drained = tokio::time::timeout(self.inner.config.batch_timeout, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    warn!(report_id = %batch.report_id, "Test worker panicked: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                report_id = %batch.report_id,
                still_running = workers.len(),
                "Batch timed out, finalizing with outstanding tests detached"
            );
            workers.detach_all();
        }
    }
}

async fn run_case(runner: &dyn TestRunner, lifecycle: &LifecycleManager, batch: &BatchContext, case: TestCaseRef) {
    let start_time = Utc::now();
    let started = Instant::now();

    let outcome = match runner.run(&case, &batch.environment).await {
        Ok(outcome) => outcome,
        Err(e) => TestOutcome::failed(
            TestStatus::Error,
            started.elapsed().as_millis() as u64,
            format!("{:#}", e),
        ),
    };

    let detail = TestDetailRecord {
        test_name: case.name,
        status: outcome.status,
        start_time,
        end_time: Utc::now(),
        duration_ms: outcome.duration_ms,
        error_message: outcome.error_message,
        artifact_ref: outcome.artifact_ref,
        test_type: case.test_type,
    };

    // Rejections are logged by the lifecycle manager.
    if let Err(e) = lifecycle.record_detail(&batch.report_id, detail).await {
        debug!(report_id = %batch.report_id, error = %e, "Detail not recorded");
    }
}
