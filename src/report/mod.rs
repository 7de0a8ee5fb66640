//! Batch reports: the per-run aggregate (`ReportContext`), per-test outcomes
//! (`TestDetailRecord`) and the explicit `BatchContext` threaded through a run.

pub mod lifecycle;
pub mod sink;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use self::lifecycle::LifecycleManager;

/// Lifecycle state of one batch. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ReportStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReportStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Running => "Running",
            ReportStatus::Completed => "Completed",
            ReportStatus::Failed => "Failed",
            ReportStatus::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(ReportStatus::Running),
            "Completed" => Ok(ReportStatus::Completed),
            "Failed" => Ok(ReportStatus::Failed),
            "Stopped" => Ok(ReportStatus::Stopped),
            other => Err(format!("unknown report status '{}'", other)),
        }
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    /// Parse the loosely formatted status words produced by external runners
    /// ("pass", "PASSED", "fail", "timeout", ...). This is the only place
    /// free-form status strings are interpreted.
    pub fn from_external(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" | "OK" | "SUCCESS" => Some(TestStatus::Passed),
            "FAIL" | "FAILED" | "FAILURE" => Some(TestStatus::Failed),
            "SKIP" | "SKIPPED" | "IGNORED" => Some(TestStatus::Skipped),
            "ERROR" | "ERRORED" | "TIMEOUT" | "TIMED_OUT" => Some(TestStatus::Error),
            _ => None,
        }
    }

    /// Failed and Error both count as failures for reporting and analytics.
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Passed => "Passed",
            TestStatus::Failed => "Failed",
            TestStatus::Skipped => "Skipped",
            TestStatus::Error => "Error",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestStatus::from_external(s).ok_or_else(|| format!("unknown test status '{}'", s))
    }
}

/// What started a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    Manual,
    Scheduled,
    Api,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Manual => "Manual",
            TriggerType::Scheduled => "Scheduled",
            TriggerType::Api => "Api",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Manual" => Ok(TriggerType::Manual),
            "Scheduled" => Ok(TriggerType::Scheduled),
            "Api" => Ok(TriggerType::Api),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

/// Aggregate record of one batch execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportContext {
    pub report_id: String,
    pub suite_type: String,
    pub environment: String,
    pub status: ReportStatus,
    pub total_tests: u64,
    pub passed_tests: u64,
    pub failed_tests: u64,
    pub skipped_tests: u64,
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub created_by: String,
    pub trigger_type: TriggerType,
    pub report_path: Option<String>,
    /// Reason attached to a Failed or Stopped report.
    pub message: Option<String>,
}

impl ReportContext {
    pub fn new(
        report_id: String,
        suite_type: &str,
        environment: &str,
        created_by: &str,
        trigger_type: TriggerType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            report_id,
            suite_type: suite_type.to_string(),
            environment: environment.to_string(),
            status: ReportStatus::Running,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            success_rate: 0.0,
            started_at,
            finished_at: None,
            duration_ms: None,
            created_by: created_by.to_string(),
            trigger_type,
            report_path: None,
            message: None,
        }
    }

    /// Count one finished test case. Error outcomes land in `failed_tests`.
    pub fn apply(&mut self, status: TestStatus) {
        match status {
            TestStatus::Passed => self.passed_tests += 1,
            TestStatus::Failed | TestStatus::Error => self.failed_tests += 1,
            TestStatus::Skipped => self.skipped_tests += 1,
        }
        self.total_tests += 1;
        self.success_rate = success_rate(self.passed_tests, self.total_tests);
    }
}

/// `passed * 100 / total`, or 0 for an empty batch.
pub fn success_rate(passed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 * 100.0 / total as f64
    }
}

/// Outcome of one test case inside a batch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDetailRecord {
    pub test_name: String,
    pub status: TestStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    /// Screenshot or log path produced by the runner.
    pub artifact_ref: Option<String>,
    pub test_type: String,
}

/// Explicit handle for one open batch, passed from the orchestrator through
/// the dispatch workers to the lifecycle manager.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub report_id: String,
    pub suite_type: String,
    pub environment: String,
    stop: CancellationToken,
}

impl BatchContext {
    pub(crate) fn new(report_id: String, suite_type: &str, environment: &str, stop: CancellationToken) -> Self {
        Self {
            report_id,
            suite_type: suite_type.to_string(),
            environment: environment.to_string(),
            stop,
        }
    }

    /// True once `stop()` was requested for this batch; no new tests should be dispatched.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves when the batch is stopped.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

static ID_SALT: OnceLock<u32> = OnceLock::new();
static ID_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Generate a report id of the form `RPT_<yyyyMMdd_HHmmss>_<8-hex>`.
///
/// The hex suffix is a per-process random salt plus an odd-multiplied
/// sequence number, which is a bijection on `u32`: ids from one process
/// cannot collide until 2^32 have been issued.
pub fn generate_report_id(now: DateTime<Utc>) -> String {
    let salt = *ID_SALT.get_or_init(rand::random::<u32>);
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix = salt.wrapping_add(seq.wrapping_mul(0x9E37_79B9));
    format!("RPT_{}_{:08x}", now.format("%Y%m%d_%H%M%S"), suffix)
}
