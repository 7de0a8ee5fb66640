//! Test runner port. How a case is executed (browser, HTTP, shell) is the
//! runner's business; the core only sees the outcome it reports.

pub mod command;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::report::TestStatus;

pub use self::command::CommandRunner;

/// Opaque reference to one test case of a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseRef {
    pub name: String,
    pub test_type: String,
    /// Runner-specific target, e.g. a shell command line.
    pub target: String,
    pub timeout: Option<Duration>,
}

/// What a runner reports for a finished case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub status: TestStatus,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub artifact_ref: Option<String>,
}

impl TestOutcome {
    pub fn failed(status: TestStatus, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status,
            duration_ms,
            error_message: Some(error.into()),
            artifact_ref: None,
        }
    }
}

/// Test runner collaborator.
#[async_trait::async_trait]
pub trait TestRunner: Send + Sync {
    /// Resolve a suite name into its test cases.
    async fn cases(&self, suite: &str) -> Result<Vec<TestCaseRef>>;

    /// Execute one case. Per-test timeouts are enforced here and reported as
    /// `TestStatus::Error`; an `Err` means the runner could not execute the
    /// case at all and is recorded as an Error detail by the caller.
    async fn run(&self, case: &TestCaseRef, environment: &str) -> Result<TestOutcome>;
}
