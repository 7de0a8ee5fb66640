use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use testmill::analysis::TimeWindow;
use testmill::config::{Config, LogFormat};
use testmill::report::{ReportStatus, TestStatus, TriggerType};
use testmill::scheduler::ScheduleDefinition;
use testmill::storage::{MemoryStore, ReportStore, SqliteStore};
use testmill::Services;

#[derive(Parser)]
#[command(
    name = "testmill",
    about = "Scheduled test-batch execution, report tracking and test analytics",
    version,
    long_about = None
)]
struct Cli {
    /// Path to testmill.toml (defaults to $TESTMILL_CONFIG, then ./testmill.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address, overrides [api].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a suite once and print its report
    Run {
        /// Suite name as declared in the configuration
        #[arg(long)]
        suite: String,

        /// Target environment passed to the test cases
        #[arg(long, default_value = "")]
        env: String,

        /// Maximum concurrent test cases
        #[arg(long)]
        parallelism: Option<usize>,

        /// Keep the report in memory instead of the database
        #[arg(long)]
        in_memory: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage scheduled batches
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect reports
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Query execution analytics
    Analytics {
        #[command(subcommand)]
        action: AnalyticsAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add (or replace) a schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (5, 6 or 7 fields)
        #[arg(long)]
        cron: String,

        /// Suite to run
        #[arg(long)]
        suite: String,

        /// Target environment
        #[arg(long, default_value = "")]
        env: String,

        /// Maximum concurrent test cases
        #[arg(long, default_value = "1")]
        parallelism: usize,
    },

    /// Remove a schedule
    Remove {
        /// Schedule name
        #[arg(long)]
        name: String,
    },

    /// Mark a schedule active
    Enable {
        #[arg(long)]
        name: String,
    },

    /// Mark a schedule inactive
    Disable {
        #[arg(long)]
        name: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum ReportAction {
    /// Show one report
    Show {
        /// Report id (RPT_...)
        id: String,

        /// Include per-test details
        #[arg(long)]
        details: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AnalyticsAction {
    /// Totals, pass rate and duration percentiles
    Summary {
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Daily pass/fail counts
    Trend {
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Per-test pass rate, latest run and trend
    Matrix {
        #[arg(long, default_value = "7")]
        days: u32,

        #[arg(long)]
        suite: Option<String>,

        /// Only count executions with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Daily failure counts per test
    Heatmap {
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Most frequently failing tests
    TopFailures {
        #[arg(long, default_value = "10")]
        limit: usize,

        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Export execution rows (or the summary) as CSV
    Export {
        #[arg(long, default_value = "7")]
        days: u32,

        /// Export the summary line instead of raw rows
        #[arg(long)]
        summary: bool,

        /// Output file; stdout if omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn ReportStore>> {
    let store = SqliteStore::open(&config.storage.path)
        .with_context(|| format!("failed to open database {}", config.storage.path))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting testmill daemon");
            testmill::serve(config).await?;
        }
        Commands::Run {
            suite,
            env,
            parallelism,
            in_memory,
            json,
        } => {
            let store: Arc<dyn ReportStore> = if in_memory {
                Arc::new(MemoryStore::new())
            } else {
                open_store(&config)?
            };
            let services = Services::build(&config, store);
            let parallelism = parallelism.unwrap_or(config.execution.default_parallelism);
            let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());

            tracing::info!(%suite, %env, parallelism, "Running suite");
            let report = services
                .orchestrator
                .run_suite(&suite, &env, parallelism, &user, TriggerType::Manual)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== testmill Report ===");
                println!("Report:   {}", report.report_id);
                println!("Suite:    {}", report.suite_type);
                println!("Status:   {}", report.status);
                println!(
                    "Tests:    {} total, {} passed, {} failed, {} skipped",
                    report.total_tests, report.passed_tests, report.failed_tests, report.skipped_tests
                );
                println!("Success:  {:.1}%", report.success_rate);
                if let Some(msg) = &report.message {
                    println!("Message:  {}", msg);
                }
                if let Some(path) = &report.report_path {
                    println!("Written:  {}", path);
                }
                println!("=======================\n");
            }
            if report.status != ReportStatus::Completed || report.failed_tests > 0 {
                std::process::exit(1);
            }
        }
        Commands::Schedule { action } => {
            let services = Services::build(&config, open_store(&config)?);
            let orchestrator = &services.orchestrator;

            match action {
                ScheduleAction::List => {
                    let list = orchestrator.schedules().await;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<20} | {:<17} | {:<12} | {:<7} | Last run",
                            "Name", "Cron", "Suite", "Active"
                        );
                        println!("{:-<20}-|-{:-<17}-|-{:-<12}-|-{:-<7}-|-{:-<25}", "", "", "", "", "");
                        for s in list {
                            let last = s
                                .last_execution
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string());
                            println!(
                                "{:<20} | {:<17} | {:<12} | {:<7} | {}",
                                s.schedule_name, s.cron_expression, s.target_suite, s.is_active, last
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    name,
                    cron,
                    suite,
                    env,
                    parallelism,
                } => {
                    let mut def = ScheduleDefinition::new(&name, &cron, &suite);
                    def.environment = env;
                    def.parallelism = parallelism;
                    let def = orchestrator.reschedule(def).await?;
                    match def.next_execution {
                        Some(next) => println!("Schedule '{}' added, next run {}.", name, next),
                        None => println!("Schedule '{}' added.", name),
                    }
                }
                ScheduleAction::Remove { name } => {
                    orchestrator.remove(&name).await?;
                    println!("Schedule '{}' removed.", name);
                }
                ScheduleAction::Enable { name } => {
                    orchestrator.activate(&name).await?;
                    println!("Schedule '{}' enabled.", name);
                }
                ScheduleAction::Disable { name } => {
                    orchestrator.deactivate(&name).await?;
                    println!("Schedule '{}' disabled.", name);
                }
                ScheduleAction::DryRun { hours } => {
                    let schedules = orchestrator.schedules().await;
                    let preview = testmill::scheduler::cron::preview_runs(&schedules, Utc::now(), hours);
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!("{} : {} ({})", run.at, run.schedule_name, run.target_suite);
                        }
                    }
                }
            }
        }
        Commands::Report { action } => {
            let services = Services::build(&config, open_store(&config)?);
            let lifecycle = services.orchestrator.lifecycle();

            match action {
                ReportAction::Show { id, details, json } => {
                    let report = lifecycle.get(&id).await?;
                    let rows = if details {
                        lifecycle.details(&id).await?
                    } else {
                        Vec::new()
                    };
                    if json {
                        let out = serde_json::json!({ "report": report, "details": rows });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        println!("{} [{}] suite={} env={}", report.report_id, report.status, report.suite_type, report.environment);
                        println!(
                            "  {} total, {} passed, {} failed, {} skipped ({:.1}%)",
                            report.total_tests, report.passed_tests, report.failed_tests, report.skipped_tests, report.success_rate
                        );
                        println!("  started {} by {} ({})", report.started_at, report.created_by, report.trigger_type);
                        if let Some(msg) = &report.message {
                            println!("  {}", msg);
                        }
                        for d in rows {
                            println!(
                                "  {:<8} {:<30} {:>7}ms {}",
                                d.status.as_str(),
                                d.test_name,
                                d.duration_ms,
                                d.error_message.unwrap_or_default()
                            );
                        }
                    }
                }
            }
        }
        Commands::Analytics { action } => {
            let services = Services::build(&config, open_store(&config)?);
            let analytics = &services.analytics;
            let now = Utc::now();

            match action {
                AnalyticsAction::Summary { days } => {
                    let summary = analytics.summary(TimeWindow::last_days(now, days)).await;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                AnalyticsAction::Trend { days } => {
                    for p in analytics.daily_trend(TimeWindow::last_days(now, days)).await {
                        println!("{}  passed={:<5} failed={}", p.date, p.passed, p.failed);
                    }
                }
                AnalyticsAction::Matrix { days, suite, status } => {
                    let status = status
                        .map(|s| s.parse::<TestStatus>().map_err(anyhow::Error::msg))
                        .transpose()?;
                    let matrix = analytics.test_matrix(days, suite, status).await;
                    println!("{:<30} | {:>6} | {:>5} | {:<8} | Trend", "Test", "Pass%", "Runs", "Latest");
                    println!("{:-<30}-|-{:->6}-|-{:->5}-|-{:-<8}-|-{:-<9}", "", "", "", "", "");
                    for e in matrix {
                        println!(
                            "{:<30} | {:>6.1} | {:>5} | {:<8} | {:?}",
                            e.test_name, e.pass_rate, e.total_runs, e.latest.status.as_str(), e.trend
                        );
                    }
                }
                AnalyticsAction::Heatmap { days } => {
                    for row in analytics.failure_heatmap(days).await {
                        let cells: Vec<String> = row.daily_failures.iter().map(|n| n.to_string()).collect();
                        println!("{:<30} {}", row.test_name, cells.join(" "));
                    }
                }
                AnalyticsAction::TopFailures { limit, days } => {
                    let top = analytics.top_failures_in(TimeWindow::last_days(now, days), limit).await;
                    if top.is_empty() {
                        println!("No failures in the last {} days.", days);
                    }
                    for (i, f) in top.iter().enumerate() {
                        println!(
                            "{:>2}. {:<30} {:>4} failures  {}",
                            i + 1,
                            f.test_name,
                            f.failure_count,
                            f.last_error.as_deref().unwrap_or("")
                        );
                    }
                }
                AnalyticsAction::Export { days, summary, output } => {
                    let window = TimeWindow::last_days(now, days);
                    let csv = if summary {
                        analytics.export_summary(window).await
                    } else {
                        analytics.export_executions(window).await
                    };
                    match output {
                        Some(path) => {
                            std::fs::write(&path, csv)
                                .with_context(|| format!("failed to write {}", path.display()))?;
                            println!("Exported to {}", path.display());
                        }
                        None => print!("{}", csv),
                    }
                }
            }
        }
    }

    Ok(())
}
