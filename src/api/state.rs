use std::sync::Arc;

use crate::analysis::AnalyticsEngine;
use crate::report::LifecycleManager;
use crate::scheduler::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub orchestrator: Orchestrator,
    pub analytics: AnalyticsEngine,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, analytics: AnalyticsEngine) -> Self {
        Self {
            lifecycle: orchestrator.lifecycle().clone(),
            orchestrator,
            analytics,
        }
    }
}
