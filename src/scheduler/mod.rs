//! Scheduled execution: schedule definitions, cron handling, the trigger
//! engine port and the orchestrator that turns fires into batch runs.

pub mod cron;
pub mod orchestrator;
pub mod trigger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// Re-export common types
pub use self::cron::CronExpr;
pub use self::orchestrator::{FireOutcome, Orchestrator, OrchestratorConfig, StartupReport};
pub use self::trigger::{FireCallback, TokioTriggerEngine, TriggerEngine};

/// A recurring batch definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub schedule_name: String,
    pub cron_expression: String,
    pub target_suite: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
}

fn default_parallelism() -> usize {
    1
}

fn default_active() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn new(name: &str, cron_expression: &str, target_suite: &str) -> Self {
        Self {
            schedule_name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            target_suite: target_suite.to_string(),
            environment: String::new(),
            parallelism: default_parallelism(),
            is_active: true,
            last_execution: None,
            next_execution: None,
        }
    }

    /// Stable trigger-engine key derived from the schedule's identity.
    pub fn job_key(&self) -> String {
        job_key_for(&self.schedule_name)
    }

    /// Check required fields and the cron syntax. Returns the parsed expression.
    pub fn validate(&self) -> CoreResult<CronExpr> {
        if self.schedule_name.trim().is_empty() {
            return Err(CoreError::Validation("schedule name is required".into()));
        }
        if self.target_suite.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "schedule '{}' has no target suite",
                self.schedule_name
            )));
        }
        if self.parallelism == 0 {
            return Err(CoreError::Validation(format!(
                "schedule '{}' needs parallelism of at least 1",
                self.schedule_name
            )));
        }
        CronExpr::parse(&self.cron_expression)
    }
}

pub fn job_key_for(schedule_name: &str) -> String {
    format!("schedule::{}", schedule_name)
}
