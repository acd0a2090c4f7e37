//! Lifecycle orchestrator: the single control plane over all instances.
//!
//! The instance table is guarded by one lock that is only held around table
//! reads and mutations. Spawning, health polling, signalling and registry
//! writes all happen with the lock released, so a slow start on one GPU set
//! never blocks status reads or work on another set.

mod monitor;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceMemory;
use api_types::GpuOccupancy;
use api_types::GpuStatus;
use api_types::InstanceState;
use api_types::InstanceStatus;
use api_types::ModelSummary;
use api_types::OrphanCleanupReport;
use api_types::RegistryEntry;
use api_types::StatusReport;
use error_stack::Report;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocator::Allocator;
use super::allocator::GpuSet;
use super::error::LifecycleError;
use super::error::Result;
use super::instance::ProcessInstance;
use super::occupancy::classify;
use super::occupancy::DeviceReading;
use super::occupancy::OccupancyPolicy;
use super::occupancy::Placement;
use super::registry::ProcessRegistry;
use super::registry::RegistryError;
use super::supervisor::ProcessSupervisor;
use super::supervisor::StartedProcess;
use super::traits::GpuTelemetry;
use super::traits::ModelCatalog;
use super::types::LaunchCommand;

/// How long shutdown waits for monitors and in-flight starts to wind down.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

struct Inner {
    allocator: Allocator,
    catalog: Arc<dyn ModelCatalog>,
    supervisor: ProcessSupervisor,
    registry: Arc<ProcessRegistry>,
    telemetry: Option<Arc<dyn GpuTelemetry>>,
    occupancy: OccupancyPolicy,
    instances: Mutex<BTreeMap<GpuSet, ProcessInstance>>,
    shutdown: CancellationToken,
    /// Monitors and detached startups
    tasks: TaskTracker,
    next_id: AtomicU64,
}

/// Serves load, unload, switch and status over a table of instances keyed by
/// disjoint GPU sets.
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

impl LifecycleOrchestrator {
    pub fn new(
        allocator: Allocator,
        catalog: Arc<dyn ModelCatalog>,
        supervisor: ProcessSupervisor,
        registry: Arc<ProcessRegistry>,
        telemetry: Option<Arc<dyn GpuTelemetry>>,
        occupancy: OccupancyPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                allocator,
                catalog,
                supervisor,
                registry,
                telemetry,
                occupancy,
                instances: Mutex::new(BTreeMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.inner.allocator
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// Adopt the verified registry entries as running instances and start a
    /// health monitor for each. Returns how many were adopted.
    pub async fn recover(&self) -> usize {
        let adopted = self
            .inner
            .registry
            .recover_on_startup(&self.inner.allocator)
            .await;

        let mut instances = self.inner.instances.lock().await;
        let mut count = 0;
        for (gpu_set, entry) in adopted {
            if let Some(active) = instances.keys().find(|active| active.intersects(&gpu_set)) {
                warn!(gpu_set = %gpu_set, active = %active, "Skipping recovered entry overlapping an active instance");
                continue;
            }
            let id = self.inner.next_instance_id();
            let mut instance = ProcessInstance::adopted(id, gpu_set.clone(), &entry);
            if let Some(model) = self.inner.catalog.get(&entry.model_id) {
                instance.model.parameters = model.parameters;
            }
            instance.monitor = Some(self.inner.spawn_monitor(gpu_set.clone(), id));
            instances.insert(gpu_set, instance);
            count += 1;
        }
        count
    }

    /// Start `model_id` on the GPU set described by `gpu_spec`.
    ///
    /// Validation failures, including devices occupied by unmanaged work,
    /// return before anything is spawned. Once spawned,
    /// startup runs to a terminal outcome even if the caller stops waiting.
    pub async fn load(&self, model_id: &str, gpu_spec: &str) -> Result<InstanceStatus> {
        self.load_checked(model_id, gpu_spec, true).await
    }

    async fn load_checked(
        &self,
        model_id: &str,
        gpu_spec: &str,
        check_occupancy: bool,
    ) -> Result<InstanceStatus> {
        let result = self.reserve_and_start(model_id, gpu_spec, check_occupancy).await;
        match &result {
            Err(err) if err.is_validation() => {
                warn!(model_id = %model_id, gpus = %gpu_spec, error = %err, "Load request rejected");
            }
            Err(err) => error!(model_id = %model_id, gpus = %gpu_spec, error = %err, "Load failed"),
            Ok(_) => {}
        }
        result
    }

    async fn reserve_and_start(
        &self,
        model_id: &str,
        gpu_spec: &str,
        check_occupancy: bool,
    ) -> Result<InstanceStatus> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }

        let model = inner
            .catalog
            .get(model_id)
            .ok_or_else(|| LifecycleError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;
        let gpu_set = inner.allocator.parse(gpu_spec)?;
        let port = inner.allocator.assign_port(&gpu_set)?;
        if check_occupancy && inner.occupancy.refuse_occupied {
            inner.ensure_unoccupied(&gpu_set).await?;
        }
        let split = inner.allocator.compute_split(&gpu_set);
        let command = inner.supervisor.build_command(&gpu_set, &model, port, &split);

        let id = {
            let mut instances = inner.instances.lock().await;
            if let Some(active) = instances.keys().find(|active| active.intersects(&gpu_set)) {
                return Err(LifecycleError::GpuConflict {
                    requested: gpu_set.key(),
                    active: active.key(),
                });
            }
            if let Some(active) = instances.values().find(|instance| instance.port == port) {
                return Err(LifecycleError::PortInUse {
                    port,
                    requested: gpu_set.key(),
                    active: active.gpu_set.key(),
                });
            }
            let id = inner.next_instance_id();
            instances.insert(
                gpu_set.clone(),
                ProcessInstance::starting(id, gpu_set.clone(), model, port, command.clone()),
            );
            id
        };
        info!(gpu_set = %gpu_set, model_id = %model_id, port = port, "Loading model");

        let startup = Arc::clone(inner);
        let key = gpu_set.key();
        inner
            .tasks
            .spawn(async move { startup.start_reserved(gpu_set, id, command, port).await })
            .await
            .map_err(|e| LifecycleError::StartFailure {
                gpu_set: key,
                message: format!("startup task failed: {e}"),
            })?
    }

    /// Stop the instance on exactly this GPU set. No instance is not an error.
    pub async fn unload(&self, gpu_spec: &str) -> Result<()> {
        let gpu_set = self.inner.allocator.parse(gpu_spec)?;
        self.inner.unload_set(&gpu_set).await
    }

    /// Unload then load. Not transactional: if the load fails the set stays
    /// empty. Asking for the model that is already running is a no-op.
    pub async fn switch(&self, gpu_spec: &str, model_id: &str) -> Result<InstanceStatus> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }
        if inner.catalog.get(model_id).is_none() {
            return Err(LifecycleError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        }
        let gpu_set = inner.allocator.parse(gpu_spec)?;

        let (current, replacing) = {
            let instances = inner.instances.lock().await;
            let current = instances
                .get(&gpu_set)
                .filter(|instance| {
                    instance.model.id == model_id && instance.state == InstanceState::Running
                })
                .map(|instance| instance.status(&inner.supervisor.settings().host, Vec::new()));
            (current, instances.contains_key(&gpu_set))
        };
        if let Some(mut status) = current {
            info!(gpu_set = %gpu_set, model_id = %model_id, "Model already running, nothing to switch");
            status.memory = inner.device_memory(&gpu_set).await;
            return Ok(status);
        }

        info!(gpu_set = %gpu_set, model_id = %model_id, "Switching model");
        inner.unload_set(&gpu_set).await?;
        // memory of the replaced server may not be released yet
        self.load_checked(model_id, &gpu_set.key(), !replacing).await
    }

    /// One instance when `gpu_spec` is given, otherwise every instance keyed
    /// by GPU set.
    pub async fn status(&self, gpu_spec: Option<&str>) -> Result<StatusReport> {
        let inner = &self.inner;
        let host = inner.supervisor.settings().host.clone();

        let Some(gpu_spec) = gpu_spec else {
            let snapshot: Vec<(GpuSet, InstanceStatus)> = {
                let instances = inner.instances.lock().await;
                instances
                    .iter()
                    .map(|(gpu_set, instance)| (gpu_set.clone(), instance.status(&host, Vec::new())))
                    .collect()
            };
            let mut all = BTreeMap::new();
            for (gpu_set, mut status) in snapshot {
                status.memory = inner.device_memory(&gpu_set).await;
                all.insert(gpu_set.key(), status);
            }
            return Ok(StatusReport::All(all));
        };

        let gpu_set = inner.allocator.parse(gpu_spec)?;
        let status = {
            let instances = inner.instances.lock().await;
            instances
                .get(&gpu_set)
                .map(|instance| instance.status(&host, Vec::new()))
        };
        match status {
            Some(mut status) => {
                status.memory = inner.device_memory(&gpu_set).await;
                Ok(StatusReport::Single(Some(status)))
            }
            None => Ok(StatusReport::Single(None)),
        }
    }

    /// Occupancy of every allocatable device, in index order.
    pub async fn gpus(&self) -> Vec<GpuStatus> {
        let inner = &self.inner;
        let (placements, tracked) = {
            let instances = inner.instances.lock().await;
            let placements: HashMap<u32, Placement> = instances
                .values()
                .flat_map(|instance| {
                    instance.gpu_set.indices().iter().map(move |&index| {
                        let placement = Placement {
                            gpu_set: instance.gpu_set.key(),
                            model_id: instance.model.id.clone(),
                        };
                        (index, placement)
                    })
                })
                .collect();
            let tracked: HashSet<u32> = instances.values().filter_map(|instance| instance.pid).collect();
            (placements, tracked)
        };

        let mut statuses = Vec::with_capacity(inner.allocator.device_count() as usize);
        for index in 0..inner.allocator.device_count() {
            let reading = inner.read_device(index).await;
            statuses.push(classify(
                index,
                placements.get(&index).cloned(),
                reading,
                &tracked,
                &inner.occupancy,
            ));
        }
        statuses
    }

    /// Last `lines` lines of server output on the GPU set, oldest first.
    /// Capped at [`MAX_LOG_LINES`](crate::domain::supervisor::MAX_LOG_LINES).
    pub async fn logs(&self, gpu_spec: &str, lines: usize) -> Result<Vec<String>> {
        let gpu_set = self.inner.allocator.parse(gpu_spec)?;
        match self.inner.supervisor.tail_log(&gpu_set, lines).await {
            Ok(Some(tail)) => Ok(tail),
            Ok(None) => Err(LifecycleError::LogsUnavailable {
                gpu_set: gpu_set.key(),
            }),
            Err(report) => {
                warn!(gpu_set = %gpu_set, error = ?report, "Failed to read server log");
                Err(LifecycleError::LogRead {
                    gpu_set: gpu_set.key(),
                    message: report.current_context().to_string(),
                })
            }
        }
    }

    /// Live processes of the managed executable that nothing tracks.
    pub async fn find_orphans(&self) -> Result<Vec<u32>> {
        let tracked = self.inner.tracked_pids().await;
        let registry = &self.inner.registry;
        registry
            .find_orphans(registry.executable(), &tracked)
            .await
            .map_err(scan_error)
    }

    pub async fn cleanup_orphans(&self, force: bool) -> Result<OrphanCleanupReport> {
        let tracked = self.inner.tracked_pids().await;
        let grace = self.inner.supervisor.settings().stop_grace;
        self.inner
            .registry
            .cleanup_orphans(force, grace, &tracked)
            .await
            .map_err(scan_error)
    }

    pub async fn registry_snapshot(&self) -> Vec<RegistryEntry> {
        self.inner.registry.snapshot().await
    }

    /// Catalog models with the GPU set each one is loaded on.
    pub async fn models(&self) -> Vec<ModelSummary> {
        let loaded: HashMap<String, String> = {
            let instances = self.inner.instances.lock().await;
            instances
                .values()
                .map(|instance| (instance.model.id.clone(), instance.gpu_set.key()))
                .collect()
        };

        let catalog = &self.inner.catalog;
        catalog
            .ids()
            .into_iter()
            .filter_map(|id| catalog.get(&id))
            .map(|model| ModelSummary {
                loaded_on: loaded.get(&model.id).cloned(),
                id: model.id,
                name: model.name,
                path: model.path,
            })
            .collect()
    }

    /// Stop monitoring and flush the registry. Instances keep running so a
    /// restarted controller can adopt them.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down lifecycle orchestrator");
        inner.shutdown.cancel();
        inner.tasks.close();
        if timeout(TASK_SHUTDOWN_TIMEOUT, inner.tasks.wait()).await.is_err() {
            warn!(
                timeout_secs = TASK_SHUTDOWN_TIMEOUT.as_secs(),
                "Background tasks did not finish in time"
            );
        }
        if let Err(report) = inner.registry.flush().await {
            log_registry_failure(&report);
        }
    }

    /// Unload every instance. Failures are logged and the rest continue.
    pub async fn shutdown_instances(&self) {
        let gpu_sets: Vec<GpuSet> = self.inner.instances.lock().await.keys().cloned().collect();
        for gpu_set in gpu_sets {
            if let Err(err) = self.inner.unload_set(&gpu_set).await {
                warn!(gpu_set = %gpu_set, error = %err, "Failed to stop instance during shutdown");
            }
        }
    }
}

impl Inner {
    fn next_instance_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_monitor(self: &Arc<Self>, gpu_set: GpuSet, id: u64) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.tasks
            .spawn(monitor::run(Arc::clone(self), gpu_set, id, token.clone()));
        token
    }

    /// Drive a reserved slot through startup to `Running` or drop the
    /// reservation.
    async fn start_reserved(
        self: Arc<Self>,
        gpu_set: GpuSet,
        id: u64,
        command: LaunchCommand,
        port: u16,
    ) -> Result<InstanceStatus> {
        let started = match self.supervisor.start(&gpu_set, &command, port).await {
            Ok(started) => started,
            Err(err) => {
                let mut instances = self.instances.lock().await;
                if instances.get(&gpu_set).is_some_and(|instance| instance.id == id) {
                    if let Some(mut instance) = instances.remove(&gpu_set) {
                        instance.transition(InstanceState::FailedStart);
                    }
                }
                return Err(err);
            }
        };
        self.activate(&gpu_set, id, started).await
    }

    async fn activate(
        self: &Arc<Self>,
        gpu_set: &GpuSet,
        id: u64,
        started: StartedProcess,
    ) -> Result<InstanceStatus> {
        let host = &self.supervisor.settings().host;
        let activated = {
            let mut instances = self.instances.lock().await;
            match instances.get_mut(gpu_set) {
                Some(instance) if instance.id == id => {
                    instance.attach(&started);
                    instance.monitor = Some(self.spawn_monitor(gpu_set.clone(), id));
                    Some((instance.registry_entry(), instance.status(host, Vec::new())))
                }
                _ => None,
            }
        };

        let Some((entry, mut status)) = activated else {
            warn!(gpu_set = %gpu_set, pid = started.pid, "Reservation vanished during startup, stopping process");
            if let Err(report) = self.supervisor.stop(started.pid, false).await {
                error!(gpu_set = %gpu_set, pid = started.pid, error = ?report, "Failed to stop orphaned startup");
            }
            return Err(LifecycleError::StartFailure {
                gpu_set: gpu_set.key(),
                message: "instance was removed during startup".to_string(),
            });
        };

        if let Some(entry) = entry {
            self.persist_entry(entry).await;
        }
        status.memory = self.device_memory(gpu_set).await;
        info!(gpu_set = %gpu_set, pid = started.pid, model_id = %status.model_id, "Model loaded");
        Ok(status)
    }

    async fn unload_set(&self, gpu_set: &GpuSet) -> Result<()> {
        let (id, pid) = {
            let mut instances = self.instances.lock().await;
            let Some(instance) = instances.get_mut(gpu_set) else {
                debug!(gpu_set = %gpu_set, "Nothing loaded on GPU set");
                return Ok(());
            };
            if instance.state == InstanceState::Starting {
                return Err(LifecycleError::InstanceBusy {
                    gpu_set: gpu_set.key(),
                    state: instance.state,
                });
            }
            instance.cancel_monitor();
            if instance.state != InstanceState::Stopping {
                instance.transition(InstanceState::Stopping);
            }
            (instance.id, instance.pid)
        };

        if let Some(pid) = pid {
            if let Err(report) = self.supervisor.stop(pid, true).await {
                error!(gpu_set = %gpu_set, pid = pid, error = ?report, "Failed to stop instance");
                return Err(LifecycleError::StopFailure {
                    gpu_set: gpu_set.key(),
                    message: report.current_context().to_string(),
                });
            }
        }

        {
            let mut instances = self.instances.lock().await;
            if instances.get(gpu_set).is_some_and(|instance| instance.id == id) {
                if let Some(mut instance) = instances.remove(gpu_set) {
                    instance.transition(InstanceState::Stopped);
                }
            }
        }
        if let Err(report) = self.registry.unregister(&gpu_set.key()).await {
            log_registry_failure(&report);
        }
        info!(gpu_set = %gpu_set, "Instance unloaded");
        Ok(())
    }

    async fn tracked_pids(&self) -> HashSet<u32> {
        self.instances
            .lock()
            .await
            .values()
            .filter_map(|instance| instance.pid)
            .collect()
    }

    async fn device_memory(&self, gpu_set: &GpuSet) -> Vec<DeviceMemory> {
        let Some(telemetry) = &self.telemetry else {
            return Vec::new();
        };
        match telemetry.device_memory(gpu_set.indices()).await {
            Ok(memory) => memory,
            Err(report) => {
                warn!(gpu_set = %gpu_set, error = %report.current_context(), "GPU memory query failed");
                Vec::new()
            }
        }
    }

    async fn read_device(&self, index: u32) -> DeviceReading {
        let Some(telemetry) = &self.telemetry else {
            return DeviceReading::default();
        };
        let memory = match telemetry.device_memory(&[index]).await {
            Ok(memory) => memory.into_iter().next(),
            Err(report) => {
                warn!(index = index, error = %report.current_context(), "GPU memory query failed");
                None
            }
        };
        let processes = match telemetry.compute_processes(index).await {
            Ok(processes) => processes,
            Err(report) => {
                debug!(index = index, error = %report.current_context(), "GPU process query failed");
                Vec::new()
            }
        };
        DeviceReading { memory, processes }
    }

    /// Refuse `gpu_set` when any device runs work the controller did not
    /// start. Sets overlapping an active instance are left to the conflict
    /// check at reservation.
    async fn ensure_unoccupied(&self, gpu_set: &GpuSet) -> Result<()> {
        if self.telemetry.is_none() {
            return Ok(());
        }
        let tracked: HashSet<u32> = {
            let instances = self.instances.lock().await;
            if instances.keys().any(|active| active.intersects(gpu_set)) {
                return Ok(());
            }
            instances.values().filter_map(|instance| instance.pid).collect()
        };

        let mut occupied = Vec::new();
        for &index in gpu_set.indices() {
            let reading = self.read_device(index).await;
            let status = classify(index, None, reading, &tracked, &self.occupancy);
            if status.occupancy == GpuOccupancy::OccupiedByOthers {
                let pids: Vec<u32> = status.foreign_processes.iter().map(|p| p.pid).collect();
                info!(gpu_set = %gpu_set, index = index, foreign_pids = ?pids, "GPU occupied by unmanaged work");
                occupied.push(index.to_string());
            }
        }
        if occupied.is_empty() {
            return Ok(());
        }
        Err(LifecycleError::GpuOccupied {
            requested: gpu_set.key(),
            devices: occupied.join(","),
        })
    }

    async fn persist_entry(&self, entry: RegistryEntry) {
        if let Err(report) = self.registry.register(entry).await {
            log_registry_failure(&report);
        }
    }

    /// Record `state` for the entry of `gpu_set` written for `pid`.
    async fn persist_status(&self, gpu_set: &GpuSet, pid: u32, state: InstanceState) {
        if let Err(report) = self.registry.update_status(&gpu_set.key(), pid, state).await {
            log_registry_failure(&report);
        }
    }
}

fn log_registry_failure(report: &Report<RegistryError>) {
    let err = LifecycleError::RegistryIo {
        message: report.current_context().to_string(),
    };
    warn!(error = %err, details = ?report, "Registry write failed, will retry on next change");
}

fn scan_error(report: Report<RegistryError>) -> LifecycleError {
    error!(error = ?report, "Orphan scan failed");
    LifecycleError::ProcessScan {
        message: report.current_context().to_string(),
    }
}
