//! TOML configuration.
//!
//! Layered: an explicit path, then `TESTMILL_CONFIG`, then `./testmill.toml`,
//! then compiled-in defaults. Every section is optional.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::scheduler::ScheduleDefinition;

const CONFIG_ENV: &str = "TESTMILL_CONFIG";
const LOCAL_CONFIG: &str = "testmill.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub suites: Vec<SuiteConfig>,
    /// Schedules seeded into storage when the daemon starts.
    #[serde(default)]
    pub schedules: Vec<ScheduleDefinition>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the env/local
    /// fallbacks are best-effort.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTMILL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(error = %e, "failed to load ./testmill.toml, using defaults"),
            }
        }

        Ok(Self::default())
    }

    pub fn suite(&self, name: &str) -> Option<&SuiteConfig> {
        self.suites.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

fn default_db_path() -> String {
    "data/testmill.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_parallelism: default_parallelism(),
            test_timeout_secs: default_test_timeout(),
            batch_timeout_secs: default_batch_timeout(),
        }
    }
}

impl ExecutionConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_test_timeout() -> u64 {
    300
}

fn default_batch_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportsConfig {
    /// Directory for per-report CSV files. Unset disables the file sink.
    #[serde(default)]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,
    #[serde(default)]
    pub cases: Vec<CaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseConfig {
    pub name: String,
    pub command: String,
    #[serde(default = "default_test_type")]
    pub test_type: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_test_type() -> String {
    "command".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.storage.path, "data/testmill.db");
        assert_eq!(cfg.execution.default_parallelism, 4);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert!(cfg.reports.output_dir.is_none());
        assert!(cfg.suites.is_empty());
    }

    #[test]
    fn test_full_file_parses() {
        let cfg: Config = toml::from_str(
            r#"
            [storage]
            path = "/var/lib/testmill/db.sqlite"

            [execution]
            default_parallelism = 2
            test_timeout_secs = 60

            [logging]
            level = "debug"
            format = "json"

            [[suites]]
            name = "smoke"

            [[suites.cases]]
            name = "login"
            command = "./t/login.sh"
            test_type = "ui"
            timeout_secs = 30

            [[schedules]]
            schedule_name = "smoke-hourly"
            cron_expression = "0 * * * *"
            target_suite = "smoke"
            parallelism = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.execution.test_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.execution.batch_timeout_secs, 3600);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        let smoke = cfg.suite("smoke").unwrap();
        assert_eq!(smoke.cases[0].timeout_secs, Some(30));
        assert_eq!(cfg.schedules[0].parallelism, 2);
        assert!(cfg.schedules[0].is_active);
        assert!(cfg.schedules[0].last_execution.is_none());
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        assert!(Config::resolve(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testmill.toml");
        std::fs::write(&path, "[api]\nbind = \"127.0.0.1:9000\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:9000");
    }
}
