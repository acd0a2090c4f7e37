//! Shared API type definitions
//!
//! Types handed to the API/UI layer by the controller, and the durable
//! registry document format. Everything here is plain serde data; behaviour
//! lives in the `controller` crate.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Current registry document format version.
pub const REGISTRY_VERSION: &str = "1.0";

/// Lifecycle state of one inference-server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    FailedStart,
    FailedPermanently,
}

impl InstanceState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Crashed -> Starting -> Crashed` is the relaunch loop of the restart
    /// policy; a plain load never goes from `Starting` to `Crashed`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, FailedStart)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Starting)
                | (Crashed, Stopping)
                | (Crashed, FailedPermanently)
                | (FailedPermanently, Stopping)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Crashed => "crashed",
            InstanceState::FailedStart => "failed_start",
            InstanceState::FailedPermanently => "failed_permanently",
        };
        f.write_str(name)
    }
}

/// Memory usage of one GPU device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMemory {
    /// Device index
    pub index: u32,
    /// Used memory in bytes
    pub used_bytes: u64,
    /// Total memory in bytes
    pub total_bytes: u64,
}

/// Status of one instance as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Canonical GPU set key, e.g. `"0,1"`
    pub gpu_set: String,
    pub state: InstanceState,
    /// Process id, absent while no process is attached
    pub pid: Option<u32>,
    pub host: String,
    pub port: u16,
    pub model_id: String,
    pub model_name: String,
    pub model_path: String,
    /// Full argv used to launch the process
    pub launch_arguments: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: Option<u64>,
    /// Number of automatic relaunches after a crash
    pub restart_count: u32,
    /// Health probes failed in a row since the last success
    pub consecutive_failures: u32,
    pub last_health_error: Option<String>,
    /// Per-device memory, empty when telemetry is unavailable
    #[serde(default)]
    pub memory: Vec<DeviceMemory>,
}

/// Result of a status query: one set, or every active set keyed by GpuSet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusReport {
    Single(Option<InstanceStatus>),
    All(BTreeMap<String, InstanceStatus>),
}

/// Durable projection of an instance, keyed by GpuSet in [`RegistryDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub pid: u32,
    pub model_id: String,
    pub model_name: String,
    pub model_path: String,
    pub gpu_set: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub launch_arguments: Vec<String>,
    pub status: InstanceState,
    /// Process start time in clock ticks since boot, used to detect pid reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<u64>,
}

/// The persisted registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub processes: BTreeMap<String, RegistryEntry>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            last_updated: Utc::now(),
            processes: BTreeMap::new(),
        }
    }
}

/// A pid that could not be terminated during orphan cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanFailure {
    pub pid: u32,
    pub reason: String,
}

/// Outcome of an orphan cleanup batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCleanupReport {
    /// Orphans discovered before termination started
    pub found: usize,
    pub killed: usize,
    pub failures: Vec<OrphanFailure>,
}

/// Catalog entry with its current placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub path: String,
    /// GpuSet key the model is loaded on, if any
    pub loaded_on: Option<String>,
}

/// What is using a GPU device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuOccupancy {
    Idle,
    /// Part of a GPU set with a managed instance
    ModelLoaded,
    /// Busy with work the controller did not start
    OccupiedByOthers,
}

/// Compute process found on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuProcess {
    pub pid: u32,
    /// Absent when the driver does not report per-process memory
    pub used_bytes: Option<u64>,
}

/// Occupancy of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    pub index: u32,
    pub occupancy: GpuOccupancy,
    /// GpuSet key of the managed instance covering this device
    pub gpu_set: Option<String>,
    pub model_id: Option<String>,
    /// Absent when telemetry is unavailable
    pub memory: Option<DeviceMemory>,
    /// Compute processes the controller does not manage
    #[serde(default)]
    pub foreign_processes: Vec<GpuProcess>,
    /// Whether the device may be chosen for a load or switch
    pub selectable: bool,
}
