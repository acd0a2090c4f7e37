//! Per-instance health monitor and crash handling.

use std::sync::Arc;

use api_types::InstanceState;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Inner;
use crate::domain::allocator::GpuSet;
use crate::domain::error::LifecycleError;

enum ProbeVerdict {
    Healthy,
    Degraded,
    Crashed,
    /// The instance was unloaded or replaced
    Gone,
}

pub(super) async fn run(inner: Arc<Inner>, gpu_set: GpuSet, id: u64, token: CancellationToken) {
    let period = inner.supervisor.settings().monitor_interval;
    let threshold = inner.supervisor.settings().crash_threshold.max(1);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(gpu_set = %gpu_set, interval_ms = period.as_millis() as u64, "Health monitor started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some((pid, port)) = inner.running_target(&gpu_set, id).await else {
            break;
        };
        let result = inner.supervisor.probe(&gpu_set, pid, port).await;
        if token.is_cancelled() {
            break;
        }

        match inner.record_probe(&gpu_set, id, result, threshold).await {
            ProbeVerdict::Healthy | ProbeVerdict::Degraded => {}
            ProbeVerdict::Crashed => {
                if !inner.handle_crash(&gpu_set, id, &token).await {
                    break;
                }
            }
            ProbeVerdict::Gone => break,
        }
    }
    debug!(gpu_set = %gpu_set, "Health monitor stopped");
}

impl Inner {
    async fn running_target(&self, gpu_set: &GpuSet, id: u64) -> Option<(u32, u16)> {
        let instances = self.instances.lock().await;
        let instance = instances.get(gpu_set)?;
        if instance.id != id || instance.state != InstanceState::Running {
            return None;
        }
        Some((instance.pid?, instance.port))
    }

    async fn record_probe(
        &self,
        gpu_set: &GpuSet,
        id: u64,
        result: Result<(), LifecycleError>,
        threshold: u32,
    ) -> ProbeVerdict {
        let mut instances = self.instances.lock().await;
        let Some(instance) = instances
            .get_mut(gpu_set)
            .filter(|instance| instance.id == id && instance.state == InstanceState::Running)
        else {
            return ProbeVerdict::Gone;
        };

        match result {
            Ok(()) => {
                if instance.consecutive_failures > 0 {
                    info!(gpu_set = %gpu_set, failures = instance.consecutive_failures, "Instance healthy again");
                }
                instance.consecutive_failures = 0;
                instance.last_health_error = None;
                ProbeVerdict::Healthy
            }
            Err(err) => {
                instance.consecutive_failures += 1;
                instance.last_health_error = Some(err.to_string());
                warn!(
                    gpu_set = %gpu_set,
                    pid = ?instance.pid,
                    failures = instance.consecutive_failures,
                    threshold = threshold,
                    error = %err,
                    "Health check failed"
                );
                if instance.consecutive_failures < threshold {
                    return ProbeVerdict::Degraded;
                }
                let crash = LifecycleError::CrashDetected {
                    gpu_set: gpu_set.key(),
                    failures: instance.consecutive_failures,
                };
                error!(gpu_set = %gpu_set, pid = ?instance.pid, error = %crash, "Instance crashed");
                instance.transition(InstanceState::Crashed);
                ProbeVerdict::Crashed
            }
        }
    }

    /// Release the devices of a crashed instance and apply the restart
    /// policy. Returns whether monitoring should continue.
    async fn handle_crash(&self, gpu_set: &GpuSet, id: u64, token: &CancellationToken) -> bool {
        let leftover = {
            let instances = self.instances.lock().await;
            instances
                .get(gpu_set)
                .filter(|instance| instance.id == id)
                .and_then(|instance| instance.pid)
        };
        if let Some(pid) = leftover {
            if let Err(report) = self.supervisor.stop(pid, false).await {
                error!(gpu_set = %gpu_set, pid = pid, error = ?report, "Failed to kill crashed instance");
            }
            self.persist_status(gpu_set, pid, InstanceState::Crashed).await;
        }

        let policy = self.supervisor.settings().restart;
        if !policy.enabled {
            info!(gpu_set = %gpu_set, "Crashed instance keeps its GPU set until unloaded");
            return false;
        }

        loop {
            let relaunch = {
                let mut instances = self.instances.lock().await;
                let Some(instance) = instances
                    .get_mut(gpu_set)
                    .filter(|instance| instance.id == id && instance.state == InstanceState::Crashed)
                else {
                    return false;
                };
                if token.is_cancelled() {
                    return false;
                }
                if instance.restart_count >= policy.max_attempts {
                    error!(gpu_set = %gpu_set, attempts = instance.restart_count, "Restart attempts exhausted");
                    instance.transition(InstanceState::FailedPermanently);
                    None
                } else {
                    instance.restart_count += 1;
                    instance.pid = None;
                    instance.transition(InstanceState::Starting);
                    Some((instance.command.clone(), instance.port, instance.restart_count))
                }
            };

            let Some((command, port, attempt)) = relaunch else {
                if let Some(pid) = leftover {
                    self.persist_status(gpu_set, pid, InstanceState::FailedPermanently).await;
                }
                return false;
            };

            info!(gpu_set = %gpu_set, attempt = attempt, max_attempts = policy.max_attempts, "Relaunching crashed instance");
            match self.supervisor.start(gpu_set, &command, port).await {
                Ok(started) => {
                    let entry = {
                        let mut instances = self.instances.lock().await;
                        match instances.get_mut(gpu_set).filter(|instance| instance.id == id) {
                            Some(instance) => {
                                instance.attach(&started);
                                instance.registry_entry()
                            }
                            None => None,
                        }
                    };
                    let Some(entry) = entry else {
                        if let Err(report) = self.supervisor.stop(started.pid, false).await {
                            error!(gpu_set = %gpu_set, pid = started.pid, error = ?report, "Failed to stop relaunched process");
                        }
                        return false;
                    };
                    self.persist_entry(entry).await;
                    info!(gpu_set = %gpu_set, pid = started.pid, "Crashed instance relaunched");
                    return true;
                }
                Err(err) => {
                    warn!(gpu_set = %gpu_set, attempt = attempt, error = %err, "Relaunch failed");
                    let mut instances = self.instances.lock().await;
                    match instances.get_mut(gpu_set).filter(|instance| instance.id == id) {
                        Some(instance) => {
                            instance.last_health_error = Some(err.to_string());
                            instance.transition(InstanceState::Crashed);
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}
