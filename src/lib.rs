//! testmill -- scheduled test-batch execution with report lifecycle tracking
//! and execution analytics.
//!
//! This crate provides the core library: the report lifecycle manager, the
//! cron-driven orchestrator, the analytics engine and their storage.

pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::analysis::AnalyticsEngine;
use crate::config::Config;
use crate::report::sink::CsvFileSink;
use crate::report::LifecycleManager;
use crate::runner::CommandRunner;
use crate::scheduler::{Orchestrator, OrchestratorConfig, TokioTriggerEngine};
use crate::storage::ReportStore;

/// The wired-up core, shared by the daemon and the one-shot CLI commands.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ReportStore>,
    pub orchestrator: Orchestrator,
    pub analytics: AnalyticsEngine,
}

impl Services {
    /// Wire the core over `store` with the shell-command runner and the
    /// tokio trigger engine described by `config`.
    pub fn build(config: &Config, store: Arc<dyn ReportStore>) -> Self {
        let mut lifecycle = LifecycleManager::new(store.clone());
        if let Some(dir) = &config.reports.output_dir {
            lifecycle = lifecycle.with_sink(Arc::new(CsvFileSink::new(dir)));
        }

        let runner = CommandRunner::new(&config.suites, config.execution.test_timeout());
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(lifecycle),
            Arc::new(runner),
            Arc::new(TokioTriggerEngine::new()),
            OrchestratorConfig {
                batch_timeout: config.execution.batch_timeout(),
            },
        );

        Self {
            analytics: AnalyticsEngine::new(store.clone()),
            store,
            orchestrator,
        }
    }
}

/// Start the testmill daemon: API server and scheduler.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.storage.path, "Initializing database");
    let store: Arc<dyn ReportStore> = Arc::new(storage::SqliteStore::open(&config.storage.path)?);

    // 2. Wire the core and start the scheduler
    let services = Services::build(&config, store);
    let seeded = services.orchestrator.seed(&config.schedules).await;
    if seeded > 0 {
        tracing::info!(seeded, "Seeded schedules from configuration");
    }
    let startup = services.orchestrator.start().await?;
    for (name, reason) in &startup.failed {
        tracing::warn!(schedule = %name, %reason, "Schedule not active this run");
    }

    // 3. Start API Server
    let addr: std::net::SocketAddr = config.api.bind.parse()?;
    let state = api::state::AppState::new(services.orchestrator.clone(), services.analytics.clone());
    let app = api::router(state);

    tracing::info!(%addr, "testmill listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
