//! Orchestrator: overlap skipping, validation before registration, start-up
//! isolation, stop and batch timeout.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, Semaphore};

use testmill::error::{CoreError, CoreResult};
use testmill::report::{LifecycleManager, ReportStatus, TestStatus, TriggerType};
use testmill::runner::{TestCaseRef, TestOutcome, TestRunner};
use testmill::scheduler::{
    CronExpr, FireCallback, FireOutcome, Orchestrator, OrchestratorConfig, ScheduleDefinition,
    TokioTriggerEngine, TriggerEngine,
};
use testmill::storage::{MemoryStore, ReportFilter, ReportStore};

/// Runner whose cases named in `hold` block until the gate is opened.
struct GatedRunner {
    cases: usize,
    hold: Vec<String>,
    started: Notify,
    gate: Semaphore,
    runs: AtomicUsize,
}

impl GatedRunner {
    fn new(cases: usize, hold: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            cases,
            hold: hold.iter().map(|s| s.to_string()).collect(),
            started: Notify::new(),
            gate: Semaphore::new(0),
            runs: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1000);
    }
}

#[async_trait::async_trait]
impl TestRunner for GatedRunner {
    async fn cases(&self, _suite: &str) -> Result<Vec<TestCaseRef>> {
        Ok((0..self.cases)
            .map(|i| TestCaseRef {
                name: format!("case-{}", i),
                test_type: "unit".into(),
                target: String::new(),
                timeout: None,
            })
            .collect())
    }

    async fn run(&self, case: &TestCaseRef, _environment: &str) -> Result<TestOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.hold.contains(&case.name) {
            self.started.notify_one();
            let _permit = self.gate.acquire().await?;
        }
        Ok(TestOutcome {
            status: TestStatus::Passed,
            duration_ms: 1,
            error_message: None,
            artifact_ref: None,
        })
    }
}

/// Trigger engine that refuses every registration.
struct BrokenTrigger;

impl TriggerEngine for BrokenTrigger {
    fn register(&self, job_key: &str, _cron: &CronExpr, _callback: FireCallback) -> CoreResult<()> {
        Err(CoreError::TriggerEngine {
            job_key: job_key.to_string(),
            reason: "scheduler thread pool shut down".into(),
        })
    }

    fn unregister(&self, _job_key: &str) -> bool {
        false
    }

    fn registered_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

struct Harness {
    orch: Orchestrator,
    store: Arc<dyn ReportStore>,
    trigger: Arc<TokioTriggerEngine>,
}

fn harness(runner: Arc<dyn TestRunner>, batch_timeout: Duration) -> Harness {
    let store: Arc<dyn ReportStore> = Arc::new(MemoryStore::new());
    let trigger = Arc::new(TokioTriggerEngine::new());
    let orch = Orchestrator::new(
        store.clone(),
        Arc::new(LifecycleManager::new(store.clone())),
        runner,
        trigger.clone(),
        OrchestratorConfig { batch_timeout },
    );
    Harness { orch, store, trigger }
}

// once a year, so the trigger itself never fires during a test
const RARE: &str = "0 0 1 1 *";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_fire_is_skipped() -> Result<()> {
    let runner = GatedRunner::new(1, &["case-0"]);
    let h = harness(runner.clone(), Duration::from_secs(60));
    let def = h.orch.register(ScheduleDefinition::new("slow", RARE, "suite")).await?;
    let key = def.job_key();

    let first = {
        let orch = h.orch.clone();
        let key = key.clone();
        tokio::spawn(async move { orch.fire(&key).await })
    };
    runner.started.notified().await;
    let last_before = h.orch.registered("slow").unwrap().last_execution;
    assert!(last_before.is_some());

    assert!(matches!(h.orch.fire(&key).await, FireOutcome::Skipped));
    assert_eq!(h.orch.registered("slow").unwrap().last_execution, last_before);
    assert_eq!(h.store.get_schedule("slow")?.unwrap().last_execution, last_before);

    runner.release();
    match first.await? {
        FireOutcome::Ran(report) => assert_eq!(report.total_tests, 1),
        other => panic!("unexpected outcome {:?}", other),
    }

    // the job is free again once the batch is done
    assert!(matches!(h.orch.fire(&key).await, FireOutcome::Ran(_)));
    assert_eq!(h.store.list_reports(&ReportFilter::default())?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_invalid_cron_rejected_before_registration() -> Result<()> {
    let h = harness(GatedRunner::new(0, &[]), Duration::from_secs(60));

    let err = h
        .orch
        .register(ScheduleDefinition::new("broken", "* * *", "suite"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(h.trigger.registered_keys().is_empty());
    assert!(h.store.get_schedule("broken")?.is_none());
    assert!(h.orch.registered("broken").is_none());
    Ok(())
}

#[tokio::test]
async fn test_identical_cron_registers_distinct_jobs() -> Result<()> {
    let h = harness(GatedRunner::new(0, &[]), Duration::from_secs(60));
    h.orch.register(ScheduleDefinition::new("a", RARE, "suite")).await?;
    h.orch.register(ScheduleDefinition::new("b", RARE, "suite")).await?;

    let mut keys = h.trigger.registered_keys();
    keys.sort();
    assert_eq!(keys, vec!["schedule::a", "schedule::b"]);

    h.orch.unregister("a").await?;
    assert_eq!(h.trigger.registered_keys(), vec!["schedule::b"]);
    Ok(())
}

#[tokio::test]
async fn test_startup_isolates_bad_schedules() -> Result<()> {
    let h = harness(GatedRunner::new(0, &[]), Duration::from_secs(60));
    h.store.save_schedule(&ScheduleDefinition::new("good-1", RARE, "suite"))?;
    h.store.save_schedule(&ScheduleDefinition::new("bad", "61 * * * *", "suite"))?;
    h.store.save_schedule(&ScheduleDefinition::new("good-2", "30 4 * * 1-5", "suite"))?;
    let mut inactive = ScheduleDefinition::new("paused", RARE, "suite");
    inactive.is_active = false;
    h.store.save_schedule(&inactive)?;

    let report = h.orch.start().await?;
    let mut registered = report.registered.clone();
    registered.sort();
    assert_eq!(registered, vec!["good-1", "good-2"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad");
    assert_eq!(h.trigger.registered_keys().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_startup_fails_when_trigger_engine_is_down() -> Result<()> {
    let store: Arc<dyn ReportStore> = Arc::new(MemoryStore::new());
    store.save_schedule(&ScheduleDefinition::new("a", RARE, "suite"))?;
    store.save_schedule(&ScheduleDefinition::new("b", RARE, "suite"))?;
    let orch = Orchestrator::new(
        store.clone(),
        Arc::new(LifecycleManager::new(store.clone())),
        GatedRunner::new(0, &[]),
        Arc::new(BrokenTrigger),
        OrchestratorConfig::default(),
    );

    assert!(matches!(orch.start().await, Err(CoreError::TriggerEngine { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_halts_dispatch() -> Result<()> {
    let runner = GatedRunner::new(10, &["case-2"]);
    let h = harness(runner.clone(), Duration::from_secs(60));

    let run = {
        let orch = h.orch.clone();
        tokio::spawn(async move { orch.run_suite("suite", "qa", 1, "ci", TriggerType::Api).await })
    };
    runner.started.notified().await;

    let running = h.orch.lifecycle().running().await;
    assert_eq!(running.len(), 1);
    h.orch.lifecycle().stop(&running[0].report_id, "operator").await?;
    runner.release();

    let report = run.await??;
    assert_eq!(report.status, ReportStatus::Stopped);
    assert_eq!(report.total_tests, 2);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_timeout_finalizes_with_hung_test_detached() -> Result<()> {
    let runner = GatedRunner::new(4, &["case-3"]);
    let h = harness(runner.clone(), Duration::from_millis(200));

    let report = h.orch.run_suite("suite", "qa", 4, "ci", TriggerType::Manual).await?;
    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.total_tests, 3);

    // the detached worker finishes later and its detail is rejected
    runner.release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.orch.lifecycle().get(&report.report_id).await?.total_tests, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registered_schedule_fires_on_its_own() -> Result<()> {
    let h = harness(GatedRunner::new(2, &[]), Duration::from_secs(60));
    // every second
    h.orch.register(ScheduleDefinition::new("tick", "* * * * * *", "suite")).await?;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.orch.unregister("tick").await?;

    let reports = h.store.list_reports(&ReportFilter::default())?;
    assert!(!reports.is_empty());
    assert!(reports.iter().all(|r| r.trigger_type == TriggerType::Scheduled));
    assert!(h.store.get_schedule("tick")?.unwrap().last_execution.is_some());
    Ok(())
}
