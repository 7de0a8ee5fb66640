//! Storage layer -- the `ReportStore` port, its SQLite implementation and an
//! in-process implementation for ephemeral runs.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;

use crate::report::{ReportContext, ReportStatus, TestDetailRecord, TestStatus};
use crate::scheduler::ScheduleDefinition;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Filter for report queries. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub status: Option<ReportStatus>,
    pub suite: Option<String>,
    pub limit: Option<usize>,
}

impl ReportFilter {
    pub fn matches(&self, r: &ReportContext) -> bool {
        self.from.map_or(true, |f| r.started_at >= f)
            && self.to.map_or(true, |t| r.started_at < t)
            && self.status.map_or(true, |s| r.status == s)
            && self.suite.as_deref().map_or(true, |s| r.suite_type == s)
    }
}

/// Filter for execution-history queries over the half-open window `[from, to)`.
#[derive(Debug, Clone)]
pub struct ExecutionFilter {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub suite: Option<String>,
    pub status: Option<TestStatus>,
}

impl ExecutionFilter {
    pub fn window(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to, suite: None, status: None }
    }

    pub fn matches(&self, e: &ExecutionRecord) -> bool {
        e.timestamp >= self.from
            && e.timestamp < self.to
            && self.suite.as_deref().map_or(true, |s| e.suite_type == s)
            && self.status.map_or(true, |s| e.status == s)
    }
}

/// One test execution joined with the batch it ran in. This is the row the
/// analytics engine aggregates over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub report_id: String,
    pub suite_type: String,
    pub environment: String,
    pub test_name: String,
    pub test_type: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    /// Start time of the test case.
    pub timestamp: DateTime<Utc>,
}

/// Storage collaborator. Each call is atomic for a single entity; there is no
/// cross-entity transaction.
///
/// Calls are blocking and must be made from `spawn_blocking` when on the
/// async runtime.
pub trait ReportStore: Send + Sync {
    fn insert_report(&self, report: &ReportContext) -> Result<()>;
    fn update_report(&self, report: &ReportContext) -> Result<()>;
    fn get_report(&self, report_id: &str) -> Result<Option<ReportContext>>;
    /// Newest first.
    fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportContext>>;

    fn insert_detail(&self, report_id: &str, detail: &TestDetailRecord) -> Result<()>;
    fn details_for(&self, report_id: &str) -> Result<Vec<TestDetailRecord>>;
    /// Oldest first.
    fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>>;

    /// Insert or replace the definition keyed by `schedule_name`.
    fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<()>;
    fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>>;
    fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDefinition>>;
    /// Returns false if no such schedule exists.
    fn set_schedule_active(&self, name: &str, active: bool) -> Result<bool>;
    fn record_schedule_run(
        &self,
        name: &str,
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Returns false if no such schedule exists.
    fn delete_schedule(&self, name: &str) -> Result<bool>;
}

/// Run a blocking store call on the blocking pool.
pub async fn run_blocking<T, F>(store: &Arc<dyn ReportStore>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ReportStore) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("storage task failed: {}", e)),
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
