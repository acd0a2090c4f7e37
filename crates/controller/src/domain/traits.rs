//! Collaborator seams injected into the orchestrator

use core::error::Error;

use api_types::DeviceMemory;
use api_types::GpuProcess;
use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;

use super::types::LaunchCommand;
use super::types::ModelSpec;
use super::types::ProcessIdentity;
use super::types::Signal;

#[derive(Debug, Display)]
pub enum ProcessError {
    #[display("Failed to spawn process: {message}")]
    Spawn { message: String },
    #[display("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[display("Process {pid} does not exist")]
    NotFound { pid: u32 },
    #[display("Failed to read proc filesystem: {message}")]
    ProcRead { message: String },
    #[display("Health check failed: {message}")]
    Health { message: String },
    #[display("Failed to read server log {path}")]
    LogRead { path: String },
}

impl Error for ProcessError {}

#[derive(Debug, Display)]
pub enum TelemetryError {
    #[display("GPU telemetry unavailable: {message}")]
    Unavailable { message: String },
    #[display("Failed to query GPU {index}: {message}")]
    Device { index: u32, message: String },
}

impl Error for TelemetryError {}

/// Read-only model lookup
pub trait ModelCatalog: Send + Sync {
    fn get(&self, id: &str) -> Option<ModelSpec>;

    /// All model ids in catalog order
    fn ids(&self) -> Vec<String>;
}

/// Spawns inference server processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start `command` detached from the controller and return its pid.
    async fn spawn(&self, command: &LaunchCommand) -> Result<u32, Report<ProcessError>>;
}

/// OS process accessor
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn is_alive(&self, pid: u32) -> bool;

    /// `None` when the pid does not exist or cannot be inspected
    async fn identity(&self, pid: u32) -> Option<ProcessIdentity>;

    /// Pids of live processes whose identity matches `executable`
    async fn find_by_name(&self, executable: &str) -> Result<Vec<u32>, Report<ProcessError>>;

    /// Deliver `signal`; a pid that no longer exists yields [`ProcessError::NotFound`].
    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), Report<ProcessError>>;
}

/// Inference server readiness check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, host: &str, port: u16) -> Result<(), Report<ProcessError>>;
}

/// Per-device memory and process telemetry
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    fn device_count(&self) -> Result<u32, Report<TelemetryError>>;

    async fn device_memory(&self, indices: &[u32]) -> Result<Vec<DeviceMemory>, Report<TelemetryError>>;

    /// Compute processes currently running on device `index`
    async fn compute_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<TelemetryError>>;
}
