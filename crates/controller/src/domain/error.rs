//! Error taxonomy surfaced to controller callers.

use std::time::Duration;

use api_types::InstanceState;
use api_types::OrphanFailure;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid GPU spec '{spec}': {reason}")]
    InvalidGpuSpec { spec: String, reason: String },

    #[error("GPU set {requested} conflicts with active set {active}")]
    GpuConflict { requested: String, active: String },

    #[error("port {port} for GPU set {requested} is already used by GPU set {active}")]
    PortInUse {
        port: u16,
        requested: String,
        active: String,
    },

    #[error("GPU(s) {devices} of set {requested} are occupied by processes the controller does not manage")]
    GpuOccupied { requested: String, devices: String },

    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("instance on GPU set {gpu_set} did not become healthy within {timeout:?}")]
    StartTimeout { gpu_set: String, timeout: Duration },

    #[error("failed to start instance on GPU set {gpu_set}: {message}")]
    StartFailure { gpu_set: String, message: String },

    #[error("health check failed for GPU set {gpu_set}: {message}")]
    HealthCheckFailure { gpu_set: String, message: String },

    #[error("instance on GPU set {gpu_set} crashed after {failures} consecutive failed health checks")]
    CrashDetected { gpu_set: String, failures: u32 },

    #[error("instance on GPU set {gpu_set} is {state}, retry once it settles")]
    InstanceBusy {
        gpu_set: String,
        state: InstanceState,
    },

    #[error("failed to stop instance on GPU set {gpu_set}: {message}")]
    StopFailure { gpu_set: String, message: String },

    #[error("registry I/O error: {message}")]
    RegistryIo { message: String },

    #[error("failed to enumerate processes: {message}")]
    ProcessScan { message: String },

    #[error("orphan cleanup could not terminate {} process(es)", failures.len())]
    OrphanCleanupPartialFailure { failures: Vec<OrphanFailure> },

    #[error("output of the server on GPU set {gpu_set} is not captured, no log directory is configured")]
    LogsUnavailable { gpu_set: String },

    #[error("failed to read server log for GPU set {gpu_set}: {message}")]
    LogRead { gpu_set: String, message: String },

    #[error("controller is shutting down")]
    ShuttingDown,
}

impl LifecycleError {
    /// Errors raised before any process was spawned.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LifecycleError::InvalidGpuSpec { .. }
                | LifecycleError::GpuConflict { .. }
                | LifecycleError::PortInUse { .. }
                | LifecycleError::GpuOccupied { .. }
                | LifecycleError::ModelNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pre_spawn_errors_are_validation() {
        let rejected = LifecycleError::GpuConflict {
            requested: "0,1".to_string(),
            active: "1".to_string(),
        };
        let failed = LifecycleError::StartTimeout {
            gpu_set: "0".to_string(),
            timeout: Duration::from_secs(60),
        };

        assert!(rejected.is_validation());
        assert!(!failed.is_validation());
        assert!(!LifecycleError::ShuttingDown.is_validation());
    }
}
