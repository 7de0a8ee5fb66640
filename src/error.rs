//! Error taxonomy shared by the lifecycle manager, orchestrator and analytics engine.

use thiserror::Error;

use crate::report::ReportStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed cron expression or missing schedule fields. Never partially applied.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("report {0} not found")]
    ReportNotFound(String),

    #[error("report {report_id} is {status}, expected Running")]
    NotRunning {
        report_id: String,
        status: ReportStatus,
    },

    #[error("trigger engine failure for {job_key}: {reason}")]
    TriggerEngine { job_key: String, reason: String },

    #[error("schedule '{0}' not found")]
    ScheduleNotFound(String),
}

impl CoreError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        CoreError::PersistenceUnavailable(err.to_string())
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
