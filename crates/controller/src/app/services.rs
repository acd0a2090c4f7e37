use std::sync::Arc;

use crate::domain::LifecycleOrchestrator;
use crate::domain::ProcessRegistry;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub registry: Arc<ProcessRegistry>,
}
