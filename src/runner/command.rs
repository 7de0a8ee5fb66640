//! Runs test cases as shell commands, with suites declared in configuration.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{TestCaseRef, TestOutcome, TestRunner};
use crate::config::SuiteConfig;
use crate::report::TestStatus;

/// Exit code conventionally used by test harnesses to signal "skipped".
const EXIT_SKIPPED: i32 = 77;
const STATUS_MARKER: &str = "TESTMILL_STATUS=";
const ARTIFACT_MARKER: &str = "TESTMILL_ARTIFACT=";
const ERROR_TAIL_CHARS: usize = 500;

pub struct CommandRunner {
    suites: HashMap<String, Vec<TestCaseRef>>,
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(suites: &[SuiteConfig], default_timeout: Duration) -> Self {
        let suites = suites
            .iter()
            .map(|s| {
                let cases = s
                    .cases
                    .iter()
                    .map(|c| TestCaseRef {
                        name: c.name.clone(),
                        test_type: c.test_type.clone(),
                        target: c.command.clone(),
                        timeout: c.timeout_secs.map(Duration::from_secs),
                    })
                    .collect();
                (s.name.clone(), cases)
            })
            .collect();
        Self { suites, default_timeout }
    }
}

/// Interpret a finished process. A `TESTMILL_STATUS=` line on stdout wins over
/// the exit code; a `TESTMILL_ARTIFACT=` line sets the artifact reference.
fn interpret(exit_code: Option<i32>, stdout: &str, stderr: &str, duration_ms: u64) -> TestOutcome {
    let mut reported = None;
    let mut artifact = None;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(word) = line.strip_prefix(STATUS_MARKER) {
            reported = TestStatus::from_external(word);
        } else if let Some(path) = line.strip_prefix(ARTIFACT_MARKER) {
            artifact = Some(path.trim().to_string());
        }
    }

    let status = reported.unwrap_or(match exit_code {
        Some(0) => TestStatus::Passed,
        Some(EXIT_SKIPPED) => TestStatus::Skipped,
        _ => TestStatus::Failed,
    });

    let error_message = if status.is_failure() {
        let tail = tail(stderr.trim(), ERROR_TAIL_CHARS);
        Some(match (tail.is_empty(), exit_code) {
            (false, _) => tail.to_string(),
            (true, Some(code)) => format!("exited with status {}", code),
            (true, None) => "terminated by signal".to_string(),
        })
    } else {
        None
    };

    TestOutcome {
        status,
        duration_ms,
        error_message,
        artifact_ref: artifact,
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[async_trait::async_trait]
impl TestRunner for CommandRunner {
    async fn cases(&self, suite: &str) -> Result<Vec<TestCaseRef>> {
        self.suites
            .get(suite)
            .cloned()
            .with_context(|| format!("Unknown suite '{}'", suite))
    }

    async fn run(&self, case: &TestCaseRef, environment: &str) -> Result<TestOutcome> {
        let timeout = case.timeout.unwrap_or(self.default_timeout);
        debug!(test = %case.name, command = %case.target, "Running test command");

        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&case.target)
            .env("TESTMILL_ENVIRONMENT", environment)
            .env("TESTMILL_TEST_NAME", &case.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn test '{}'", case.name))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                Ok(interpret(
                    out.status.code(),
                    &String::from_utf8_lossy(&out.stdout),
                    &String::from_utf8_lossy(&out.stderr),
                    elapsed,
                ))
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to collect output of '{}'", case.name)),
            Err(_) => {
                warn!(test = %case.name, timeout_secs = timeout.as_secs(), "Test timed out");
                Ok(TestOutcome::failed(
                    TestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    format!("timed out after {}s", timeout.as_secs()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaseConfig;

    fn runner(cases: Vec<CaseConfig>) -> CommandRunner {
        CommandRunner::new(
            &[SuiteConfig { name: "unit".into(), cases }],
            Duration::from_secs(10),
        )
    }

    fn case(name: &str, command: &str) -> CaseConfig {
        CaseConfig {
            name: name.into(),
            command: command.into(),
            test_type: "shell".into(),
            timeout_secs: None,
        }
    }

    #[test]
    fn test_interpret_exit_codes() {
        assert_eq!(interpret(Some(0), "", "", 5).status, TestStatus::Passed);
        assert_eq!(interpret(Some(77), "", "", 5).status, TestStatus::Skipped);
        let failed = interpret(Some(3), "", "", 5);
        assert_eq!(failed.status, TestStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("exited with status 3"));
    }

    #[test]
    fn test_interpret_status_marker_wins() {
        let out = "noise\nTESTMILL_ARTIFACT=/tmp/shot.png\nTESTMILL_STATUS=skipped\n";
        let outcome = interpret(Some(1), out, "", 5);
        assert_eq!(outcome.status, TestStatus::Skipped);
        assert_eq!(outcome.artifact_ref.as_deref(), Some("/tmp/shot.png"));
        assert!(outcome.error_message.is_none());
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[tokio::test]
    async fn test_unknown_suite_errors() {
        let r = runner(vec![]);
        assert!(r.cases("nope").await.is_err());
        assert!(r.cases("unit").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runs_shell_commands() -> Result<()> {
        let r = runner(vec![
            case("ok", "exit 0"),
            case("bad", "echo broken >&2; exit 1"),
            case("env", "test \"$TESTMILL_ENVIRONMENT\" = staging"),
        ]);
        let cases = r.cases("unit").await?;

        let ok = r.run(&cases[0], "qa").await?;
        assert_eq!(ok.status, TestStatus::Passed);

        let bad = r.run(&cases[1], "qa").await?;
        assert_eq!(bad.status, TestStatus::Failed);
        assert_eq!(bad.error_message.as_deref(), Some("broken"));

        assert_eq!(r.run(&cases[2], "staging").await?.status, TestStatus::Passed);
        assert_eq!(r.run(&cases[2], "prod").await?.status, TestStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_reported_as_error() -> Result<()> {
        let mut slow = case("slow", "sleep 5");
        slow.timeout_secs = Some(1);
        let r = runner(vec![slow]);
        let cases = r.cases("unit").await?;
        let outcome = r.run(&cases[0], "").await?;
        assert_eq!(outcome.status, TestStatus::Error);
        assert!(outcome.error_message.unwrap().contains("timed out"));
        Ok(())
    }
}
