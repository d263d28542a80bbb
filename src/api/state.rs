use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::orchestrator::ExecutionOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub config: Arc<ControllerConfig>,
}
