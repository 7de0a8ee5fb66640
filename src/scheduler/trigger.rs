//! Trigger engine port and a tokio-backed implementation.
//!
//! The engine owns one background task per job key. Each task sleeps until
//! the next cron instant and then awaits the callback, so a job never has two
//! callbacks in flight; instants that pass while a callback is still running
//! are not replayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CronExpr;
use crate::error::{CoreError, CoreResult};

pub type FireCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Minimal recurring-trigger port.
pub trait TriggerEngine: Send + Sync {
    /// Fire `callback` at each instant matching `cron`. Replaces any existing
    /// registration under the same key.
    fn register(&self, job_key: &str, cron: &CronExpr, callback: FireCallback) -> CoreResult<()>;

    /// Returns false if the key was not registered.
    fn unregister(&self, job_key: &str) -> bool;

    fn registered_keys(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct TokioTriggerEngine {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        // Map entries are plain handles; a poisoned guard is still consistent.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn trigger_loop(job_key: String, cron: CronExpr, callback: FireCallback) {
    loop {
        let now = Utc::now();
        let Some(next) = cron.next_after(&now) else {
            info!(job = %job_key, "Cron expression has no future instants, trigger finished");
            return;
        };

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        debug!(job = %job_key, at = %next, "Trigger firing");
        // The callback runs on its own task so that unregistering this loop
        // does not cancel a batch that is already in progress.
        let fire = tokio::spawn((callback)());
        if let Err(e) = fire.await {
            warn!(job = %job_key, "Fire callback panicked: {}", e);
        }
    }
}

impl TriggerEngine for TokioTriggerEngine {
    fn register(&self, job_key: &str, cron: &CronExpr, callback: FireCallback) -> CoreResult<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| CoreError::TriggerEngine {
            job_key: job_key.to_string(),
            reason: format!("no async runtime available: {}", e),
        })?;

        let task = handle.spawn(trigger_loop(job_key.to_string(), cron.clone(), callback));
        if let Some(previous) = self.jobs().insert(job_key.to_string(), task) {
            debug!(job = %job_key, "Replacing existing trigger");
            previous.abort();
        }
        info!(job = %job_key, cron = %cron.as_str(), "Trigger registered");
        Ok(())
    }

    fn unregister(&self, job_key: &str) -> bool {
        match self.jobs().remove(job_key) {
            Some(task) => {
                task.abort();
                info!(job = %job_key, "Trigger unregistered");
                true
            }
            None => false,
        }
    }

    fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for TokioTriggerEngine {
    fn drop(&mut self) {
        for (_, task) in self.jobs().drain() {
            task.abort();
        }
    }
}
