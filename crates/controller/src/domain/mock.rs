//! Test adapters implementing the collaborator traits
//!
//! In-memory stand-ins for the OS process table, the process launcher, the
//! health endpoint and GPU telemetry. Used by unit tests and by the
//! integration tests under `tests/`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use api_types::DeviceMemory;
use api_types::GpuProcess;
use async_trait::async_trait;
use error_stack::Report;

use super::traits::GpuTelemetry;
use super::traits::HealthProbe;
use super::traits::ProcessError;
use super::traits::ProcessLauncher;
use super::traits::ProcessTable;
use super::traits::TelemetryError;
use super::types::LaunchCommand;
use super::types::ProcessIdentity;
use super::types::Signal;

struct FakeProcess {
    identity: ProcessIdentity,
    ignores_terminate: bool,
    denies_signals: bool,
}

struct FakeTableState {
    processes: HashMap<u32, FakeProcess>,
    signals: Vec<(u32, Signal)>,
    next_pid: u32,
}

/// Simulated OS process table. Processes exit as soon as they receive a
/// signal unless told otherwise.
pub struct FakeProcessTable {
    state: Mutex<FakeTableState>,
    kill_delay: Mutex<Duration>,
}

impl Default for FakeProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeTableState {
                processes: HashMap::new(),
                signals: Vec::new(),
                next_pid: 3_900_000,
            }),
            kill_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Start a process named `name` and return its pid.
    pub fn add_process(&self, name: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(
            pid,
            FakeProcess {
                identity: ProcessIdentity {
                    pid,
                    name: name.to_string(),
                    exe: None,
                    start_time: Some(u64::from(pid) * 10),
                },
                ignores_terminate: false,
                denies_signals: false,
            },
        );
        pid
    }

    /// Put a process with a specific identity into the table.
    pub fn insert(&self, identity: ProcessIdentity) {
        let mut state = self.state.lock().unwrap();
        state.next_pid = state.next_pid.max(identity.pid);
        state.processes.insert(
            identity.pid,
            FakeProcess {
                identity,
                ignores_terminate: false,
                denies_signals: false,
            },
        );
    }

    /// Make `pid` disappear without a signal, like a crash.
    pub fn exit(&self, pid: u32) {
        self.state.lock().unwrap().processes.remove(&pid);
    }

    pub fn ignore_terminate(&self, pid: u32) {
        if let Some(process) = self.state.lock().unwrap().processes.get_mut(&pid) {
            process.ignores_terminate = true;
        }
    }

    /// Signals to `pid` fail, like EPERM on a foreign process.
    pub fn deny_signals(&self, pid: u32) {
        if let Some(process) = self.state.lock().unwrap().processes.get_mut(&pid) {
            process.denies_signals = true;
        }
    }

    /// Hold every SIGKILL for `delay` before it takes effect.
    pub fn set_kill_delay(&self, delay: Duration) {
        *self.kill_delay.lock().unwrap() = delay;
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn alive_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state.lock().unwrap().processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

#[async_trait]
impl ProcessTable for FakeProcessTable {
    async fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    async fn identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.state
            .lock()
            .unwrap()
            .processes
            .get(&pid)
            .map(|process| process.identity.clone())
    }

    async fn find_by_name(&self, executable: &str) -> Result<Vec<u32>, Report<ProcessError>> {
        let state = self.state.lock().unwrap();
        let mut pids: Vec<u32> = state
            .processes
            .values()
            .filter(|process| process.identity.matches_executable(executable))
            .map(|process| process.identity.pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), Report<ProcessError>> {
        let delay = *self.kill_delay.lock().unwrap();
        if signal == Signal::Kill && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let Some(process) = state.processes.get(&pid) else {
            return Err(Report::new(ProcessError::NotFound { pid }));
        };
        if process.denies_signals {
            return Err(Report::new(ProcessError::Signal {
                pid,
                message: "operation not permitted".to_string(),
            }));
        }
        let survives = signal == Signal::Terminate && process.ignores_terminate;
        state.signals.push((pid, signal));
        if !survives {
            state.processes.remove(&pid);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehaviour {
    /// Process starts and keeps running
    Spawn,
    /// Spawning itself fails
    FailSpawn,
    /// Process starts and exits right away
    ExitImmediately,
}

/// Launcher that creates processes in a [`FakeProcessTable`].
pub struct FakeLauncher {
    table: Arc<FakeProcessTable>,
    behaviour: Mutex<LaunchBehaviour>,
    launched: Mutex<Vec<LaunchCommand>>,
}

impl FakeLauncher {
    pub fn new(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table,
            behaviour: Mutex::new(LaunchBehaviour::Spawn),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behaviour(&self, behaviour: LaunchBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn launched(&self) -> Vec<LaunchCommand> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, command: &LaunchCommand) -> Result<u32, Report<ProcessError>> {
        let behaviour = *self.behaviour.lock().unwrap();
        if behaviour == LaunchBehaviour::FailSpawn {
            return Err(Report::new(ProcessError::Spawn {
                message: format!("{} not found", command.program.display()),
            }));
        }

        self.launched.lock().unwrap().push(command.clone());
        let name = Path::new(&command.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pid = self.table.add_process(&name);
        if behaviour == LaunchBehaviour::ExitImmediately {
            self.table.exit(pid);
        }
        Ok(pid)
    }
}

/// Health endpoint that answers per port; every port is healthy by default.
#[derive(Default)]
pub struct FakeHealthProbe {
    unhealthy_ports: Mutex<HashSet<u16>>,
    checks: AtomicUsize,
}

impl FakeHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, port: u16, healthy: bool) {
        let mut ports = self.unhealthy_ports.lock().unwrap();
        if healthy {
            ports.remove(&port);
        } else {
            ports.insert(port);
        }
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeHealthProbe {
    async fn check(&self, host: &str, port: u16) -> Result<(), Report<ProcessError>> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy_ports.lock().unwrap().contains(&port) {
            return Err(Report::new(ProcessError::Health {
                message: format!("http://{host}:{port}/health returned 503"),
            }));
        }
        Ok(())
    }
}

/// Per-device memory figures and compute processes set by the test.
pub struct FakeTelemetry {
    devices: Mutex<Vec<(u64, u64)>>,
    processes: Mutex<HashMap<u32, Vec<GpuProcess>>>,
}

impl FakeTelemetry {
    /// One `(used, total)` pair per device index.
    pub fn new(devices: Vec<(u64, u64)>) -> Self {
        Self {
            devices: Mutex::new(devices),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_used(&self, index: u32, used_bytes: u64) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(index as usize) {
            device.0 = used_bytes;
        }
    }

    /// Report `pids` as the compute processes on device `index`.
    pub fn set_processes(&self, index: u32, pids: &[u32]) {
        let processes = pids
            .iter()
            .map(|&pid| GpuProcess {
                pid,
                used_bytes: Some(64 * 1024 * 1024),
            })
            .collect();
        self.processes.lock().unwrap().insert(index, processes);
    }
}

#[async_trait]
impl GpuTelemetry for FakeTelemetry {
    fn device_count(&self) -> Result<u32, Report<TelemetryError>> {
        Ok(self.devices.lock().unwrap().len() as u32)
    }

    async fn device_memory(&self, indices: &[u32]) -> Result<Vec<DeviceMemory>, Report<TelemetryError>> {
        let devices = self.devices.lock().unwrap();
        indices
            .iter()
            .map(|&index| {
                let (used_bytes, total_bytes) =
                    devices.get(index as usize).copied().ok_or_else(|| {
                        Report::new(TelemetryError::Device {
                            index,
                            message: "no such device".to_string(),
                        })
                    })?;
                Ok(DeviceMemory {
                    index,
                    used_bytes,
                    total_bytes,
                })
            })
            .collect()
    }

    async fn compute_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<TelemetryError>> {
        if index as usize >= self.devices.lock().unwrap().len() {
            return Err(Report::new(TelemetryError::Device {
                index,
                message: "no such device".to_string(),
            }));
        }
        Ok(self
            .processes
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .unwrap_or_default())
    }
}
