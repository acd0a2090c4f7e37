//! In-memory record of one inference server bound to a GPU set.

use api_types::DeviceMemory;
use api_types::InstanceState;
use api_types::InstanceStatus;
use api_types::RegistryEntry;
use chrono::DateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::allocator::GpuSet;
use super::supervisor::StartedProcess;
use super::types::LaunchCommand;
use super::types::LaunchParameters;
use super::types::ModelSpec;

#[derive(Debug)]
pub struct ProcessInstance {
    /// Distinguishes successive instances on the same GPU set
    pub id: u64,
    pub gpu_set: GpuSet,
    pub pid: Option<u32>,
    pub port: u16,
    pub model: ModelSpec,
    pub command: LaunchCommand,
    pub started_at: DateTime<Utc>,
    pub state: InstanceState,
    pub process_start_time: Option<u64>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_health_error: Option<String>,
    pub monitor: Option<CancellationToken>,
}

impl ProcessInstance {
    /// Reservation placed in the table before the process is spawned.
    pub fn starting(
        id: u64,
        gpu_set: GpuSet,
        model: ModelSpec,
        port: u16,
        command: LaunchCommand,
    ) -> Self {
        Self {
            id,
            gpu_set,
            pid: None,
            port,
            model,
            command,
            started_at: Utc::now(),
            state: InstanceState::Starting,
            process_start_time: None,
            restart_count: 0,
            consecutive_failures: 0,
            last_health_error: None,
            monitor: None,
        }
    }

    /// Instance rebuilt from a verified registry entry, already running.
    pub fn adopted(id: u64, gpu_set: GpuSet, entry: &RegistryEntry) -> Self {
        let command = LaunchCommand::from_argv(&entry.launch_arguments).unwrap_or(LaunchCommand {
            program: Default::default(),
            args: Vec::new(),
            log_file: None,
        });
        Self {
            id,
            gpu_set,
            pid: Some(entry.pid),
            port: entry.port,
            model: ModelSpec {
                id: entry.model_id.clone(),
                name: entry.model_name.clone(),
                path: entry.model_path.clone(),
                parameters: LaunchParameters::default(),
            },
            command,
            started_at: entry.started_at,
            state: InstanceState::Running,
            process_start_time: entry.process_start_time,
            restart_count: 0,
            consecutive_failures: 0,
            last_health_error: None,
            monitor: None,
        }
    }

    /// Move to `next` if the state machine allows it. Illegal moves are
    /// logged and leave the state untouched.
    pub fn transition(&mut self, next: InstanceState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                gpu_set = %self.gpu_set,
                from = %self.state,
                to = %next,
                "Ignoring illegal instance state transition"
            );
            return false;
        }
        info!(gpu_set = %self.gpu_set, pid = ?self.pid, from = %self.state, to = %next, "Instance state changed");
        self.state = next;
        true
    }

    /// Record a process that passed its startup health check.
    pub fn attach(&mut self, started: &StartedProcess) {
        self.pid = Some(started.pid);
        self.started_at = started.started_at;
        self.process_start_time = started.process_start_time;
        self.consecutive_failures = 0;
        self.last_health_error = None;
        self.transition(InstanceState::Running);
    }

    pub fn cancel_monitor(&mut self) {
        if let Some(token) = self.monitor.take() {
            token.cancel();
        }
    }

    /// Durable projection, `None` while no process is attached.
    pub fn registry_entry(&self) -> Option<RegistryEntry> {
        Some(RegistryEntry {
            pid: self.pid?,
            model_id: self.model.id.clone(),
            model_name: self.model.name.clone(),
            model_path: self.model.path.clone(),
            gpu_set: self.gpu_set.key(),
            port: self.port,
            started_at: self.started_at,
            launch_arguments: self.command.argv(),
            status: self.state,
            process_start_time: self.process_start_time,
        })
    }

    pub fn status(&self, host: &str, memory: Vec<DeviceMemory>) -> InstanceStatus {
        let uptime_seconds = match self.state {
            InstanceState::Running => u64::try_from((Utc::now() - self.started_at).num_seconds()).ok(),
            _ => None,
        };
        InstanceStatus {
            gpu_set: self.gpu_set.key(),
            state: self.state,
            pid: self.pid,
            host: host.to_string(),
            port: self.port,
            model_id: self.model.id.clone(),
            model_name: self.model.name.clone(),
            model_path: self.model.path.clone(),
            launch_arguments: self.command.argv(),
            started_at: self.started_at,
            uptime_seconds,
            restart_count: self.restart_count,
            consecutive_failures: self.consecutive_failures,
            last_health_error: self.last_health_error.clone(),
            memory,
        }
    }
}
