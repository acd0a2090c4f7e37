//! Spawning, readiness polling and termination of inference server processes.

use std::io::ErrorKind;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::allocator::format_split;
use super::allocator::GpuSet;
use super::error::LifecycleError;
use super::error::Result;
use super::traits::HealthProbe;
use super::traits::ProcessError;
use super::traits::ProcessLauncher;
use super::traits::ProcessTable;
use super::types::LaunchCommand;
use super::types::ModelSpec;
use super::types::Signal;
use super::types::StopOutcome;

/// Liveness poll period while waiting for a signalled process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Upper bound on lines returned by [`ProcessSupervisor::tail_log`].
pub const MAX_LOG_LINES: usize = 300;
/// Only this much of the end of a log file is read when tailing.
const LOG_TAIL_BYTES: u64 = 1024 * 1024;

/// Bounded relaunch of crashed instances. Disabled unless enabled explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Inference server executable, a bare name is resolved through `PATH`
    pub executable: String,
    pub host: String,
    /// Directory for per-instance server output, discarded when unset
    pub log_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
    /// First delay between startup health probes
    pub health_interval: Duration,
    /// Upper bound for the doubling startup delay
    pub health_max_interval: Duration,
    /// Period of the health monitor once running
    pub monitor_interval: Duration,
    /// Consecutive failed probes before an instance is declared crashed
    pub crash_threshold: u32,
    pub stop_grace: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            executable: "llama-server".to_string(),
            host: "127.0.0.1".to_string(),
            log_dir: None,
            startup_timeout: Duration::from_secs(60),
            health_interval: Duration::from_millis(500),
            health_max_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(10),
            crash_threshold: 3,
            stop_grace: Duration::from_secs(10),
            restart: RestartPolicy::default(),
        }
    }
}

/// A process that passed its startup health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub process_start_time: Option<u64>,
}

/// Drives single processes through start, health probing and stop. Holds no
/// per-instance state; the orchestrator owns the instance table.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    launcher: Arc<dyn ProcessLauncher>,
    table: Arc<dyn ProcessTable>,
    probe: Arc<dyn HealthProbe>,
}

impl ProcessSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        table: Arc<dyn ProcessTable>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            settings,
            launcher,
            table,
            probe,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Command line for serving `model` on `gpu_set`.
    pub fn build_command(
        &self,
        gpu_set: &GpuSet,
        model: &ModelSpec,
        port: u16,
        split: &[f64],
    ) -> LaunchCommand {
        let mut args = vec![
            "-m".to_string(),
            model.path.clone(),
            "--host".to_string(),
            self.settings.host.clone(),
            "--port".to_string(),
            port.to_string(),
            "--tensor-split".to_string(),
            format_split(split),
            "--main-gpu".to_string(),
            gpu_set.min().to_string(),
        ];

        let params = &model.parameters;
        let optional = [
            ("--ctx-size", params.ctx_size.map(|v| v.to_string())),
            ("--n-gpu-layers", params.n_gpu_layers.map(|v| v.to_string())),
            ("--threads", params.threads.map(|v| v.to_string())),
            ("--batch-size", params.batch_size.map(|v| v.to_string())),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        args.extend(params.extra_args.iter().cloned());

        LaunchCommand {
            program: PathBuf::from(&self.settings.executable),
            args,
            log_file: self.log_path(gpu_set),
        }
    }

    /// File receiving the output of the server on `gpu_set`, if captured.
    pub fn log_path(&self, gpu_set: &GpuSet) -> Option<PathBuf> {
        self.settings.log_dir.as_ref().map(|dir| {
            dir.join(format!(
                "inference-gpu{}.log",
                gpu_set.key().replace(',', "-")
            ))
        })
    }

    /// Last `lines` lines of the server output on `gpu_set`, at most
    /// [`MAX_LOG_LINES`]. `None` when output is not captured; a log file that
    /// does not exist yet reads as empty.
    pub async fn tail_log(
        &self,
        gpu_set: &GpuSet,
        lines: usize,
    ) -> std::result::Result<Option<Vec<String>>, Report<ProcessError>> {
        let Some(path) = self.log_path(gpu_set) else {
            return Ok(None);
        };
        let read_error = || ProcessError::LogRead {
            path: path.display().to_string(),
        };

        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Some(Vec::new())),
            Err(e) => return Err(Report::new(e).change_context(read_error())),
        };
        let size = file.metadata().await.change_context_lazy(read_error)?.len();
        let offset = size.saturating_sub(LOG_TAIL_BYTES);
        file.seek(SeekFrom::Start(offset))
            .await
            .change_context_lazy(read_error)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .await
            .change_context_lazy(read_error)?;

        let text = String::from_utf8_lossy(&raw);
        let mut all: Vec<&str> = text.lines().collect();
        if offset > 0 && !all.is_empty() {
            // first line is cut by the seek
            all.remove(0);
        }
        let keep = lines.min(MAX_LOG_LINES);
        let start = all.len().saturating_sub(keep);
        Ok(Some(all[start..].iter().map(|line| line.to_string()).collect()))
    }

    /// Spawn `command` and wait until it answers health checks.
    ///
    /// Fails with `StartFailure` as soon as the process disappears, or with
    /// `StartTimeout` once the startup timeout elapses. In both cases the
    /// process has been killed before the error is returned.
    pub async fn start(
        &self,
        gpu_set: &GpuSet,
        command: &LaunchCommand,
        port: u16,
    ) -> Result<StartedProcess> {
        let key = gpu_set.key();
        let started_at = Utc::now();

        let pid = self.launcher.spawn(command).await.map_err(|report| {
            error!(gpu_set = %key, error = ?report, "Failed to spawn inference server");
            LifecycleError::StartFailure {
                gpu_set: key.clone(),
                message: report.current_context().to_string(),
            }
        })?;
        info!(gpu_set = %key, pid = pid, port = port, "Inference server spawned, waiting for health");

        let outcome = match timeout(
            self.settings.startup_timeout,
            self.wait_until_healthy(pid, port),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(LifecycleError::StartFailure {
                gpu_set: key.clone(),
                message,
            }),
            Err(_) => Err(LifecycleError::StartTimeout {
                gpu_set: key.clone(),
                timeout: self.settings.startup_timeout,
            }),
        };

        if let Err(err) = outcome {
            warn!(gpu_set = %key, pid = pid, error = %err, "Inference server failed to start, terminating it");
            if let Err(report) = self.stop(pid, false).await {
                error!(gpu_set = %key, pid = pid, error = ?report, "Failed to kill inference server after failed start");
            }
            return Err(err);
        }

        let process_start_time = self
            .table
            .identity(pid)
            .await
            .and_then(|identity| identity.start_time);
        info!(gpu_set = %key, pid = pid, port = port, "Inference server is healthy");

        Ok(StartedProcess {
            pid,
            started_at,
            process_start_time,
        })
    }

    async fn wait_until_healthy(&self, pid: u32, port: u16) -> std::result::Result<(), String> {
        let mut delay = self.settings.health_interval;
        loop {
            if !self.table.is_alive(pid).await {
                return Err(format!("process {pid} exited during startup"));
            }
            match self.probe.check(&self.settings.host, port).await {
                Ok(()) => return Ok(()),
                Err(report) => {
                    debug!(pid = pid, port = port, error = %report.current_context(), "Inference server not ready yet");
                }
            }
            sleep(delay).await;
            delay = (delay * 2).min(self.settings.health_max_interval);
        }
    }

    /// One monitor probe: the process must be alive and its endpoint healthy.
    pub async fn probe(&self, gpu_set: &GpuSet, pid: u32, port: u16) -> Result<()> {
        if !self.table.is_alive(pid).await {
            return Err(LifecycleError::HealthCheckFailure {
                gpu_set: gpu_set.key(),
                message: format!("process {pid} is not running"),
            });
        }
        self.probe
            .check(&self.settings.host, port)
            .await
            .map_err(|report| LifecycleError::HealthCheckFailure {
                gpu_set: gpu_set.key(),
                message: report.current_context().to_string(),
            })
    }

    /// Stop `pid`, gracefully (SIGTERM, grace period, SIGKILL) or at once.
    pub async fn stop(&self, pid: u32, graceful: bool) -> std::result::Result<StopOutcome, Report<ProcessError>> {
        terminate(self.table.as_ref(), pid, graceful, self.settings.stop_grace).await
    }
}

/// Termination sequence shared by instance stop and orphan cleanup.
///
/// A pid that is already gone counts as stopped.
pub async fn terminate(
    table: &dyn ProcessTable,
    pid: u32,
    graceful: bool,
    grace: Duration,
) -> std::result::Result<StopOutcome, Report<ProcessError>> {
    if !table.is_alive(pid).await {
        debug!(pid = pid, "Process already exited");
        return Ok(StopOutcome::AlreadyExited);
    }

    if graceful {
        match table.signal(pid, Signal::Terminate).await {
            Ok(()) => {}
            Err(report) if matches!(report.current_context(), ProcessError::NotFound { .. }) => {
                return Ok(StopOutcome::AlreadyExited);
            }
            Err(report) => {
                warn!(pid = pid, error = ?report, "SIGTERM failed, escalating to SIGKILL");
            }
        }
        if wait_for_exit(table, pid, grace).await {
            info!(pid = pid, "Process terminated gracefully");
            return Ok(StopOutcome::Terminated);
        }
        warn!(pid = pid, grace_secs = grace.as_secs_f64(), "Process ignored SIGTERM, sending SIGKILL");
    }

    match table.signal(pid, Signal::Kill).await {
        Ok(()) => {}
        Err(report) if matches!(report.current_context(), ProcessError::NotFound { .. }) => {
            return Ok(StopOutcome::AlreadyExited);
        }
        Err(report) => return Err(report),
    }

    if wait_for_exit(table, pid, KILL_WAIT).await {
        info!(pid = pid, "Process killed");
        Ok(StopOutcome::Killed)
    } else {
        Err(Report::new(ProcessError::Signal {
            pid,
            message: "still alive after SIGKILL".to_string(),
        }))
    }
}

async fn wait_for_exit(table: &dyn ProcessTable, pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if !table.is_alive(pid).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(STOP_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::mock::FakeHealthProbe;
    use crate::domain::mock::FakeLauncher;
    use crate::domain::mock::FakeProcessTable;
    use crate::domain::mock::LaunchBehaviour;
    use crate::domain::types::LaunchParameters;

    struct Harness {
        table: Arc<FakeProcessTable>,
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeHealthProbe>,
        supervisor: ProcessSupervisor,
    }

    fn harness() -> Harness {
        let table = Arc::new(FakeProcessTable::new());
        let launcher = Arc::new(FakeLauncher::new(table.clone()));
        let probe = Arc::new(FakeHealthProbe::new());
        let settings = SupervisorSettings {
            startup_timeout: Duration::from_millis(300),
            health_interval: Duration::from_millis(10),
            health_max_interval: Duration::from_millis(40),
            stop_grace: Duration::from_millis(200),
            ..SupervisorSettings::default()
        };
        let supervisor =
            ProcessSupervisor::new(settings, launcher.clone(), table.clone(), probe.clone());
        Harness {
            table,
            launcher,
            probe,
            supervisor,
        }
    }

    fn model() -> ModelSpec {
        ModelSpec {
            id: "qwen".to_string(),
            name: "Qwen".to_string(),
            path: "/models/qwen.gguf".to_string(),
            parameters: LaunchParameters {
                ctx_size: Some(8192),
                n_gpu_layers: Some(99),
                threads: None,
                batch_size: None,
                extra_args: vec!["--flash-attn".to_string()],
            },
        }
    }

    #[test]
    fn command_line_carries_split_and_parameters() {
        let h = harness();
        let set: GpuSet = "1,0".parse().expect("should parse");
        let command = h.supervisor.build_command(&set, &model(), 8081, &[0.5, 0.5]);

        assert_eq!(command.program, PathBuf::from("llama-server"));
        assert_eq!(
            command.args,
            vec![
                "-m",
                "/models/qwen.gguf",
                "--host",
                "127.0.0.1",
                "--port",
                "8081",
                "--tensor-split",
                "0.5,0.5",
                "--main-gpu",
                "0",
                "--ctx-size",
                "8192",
                "--n-gpu-layers",
                "99",
                "--flash-attn",
            ]
        );
        assert_eq!(command.log_file, None);
    }

    #[test(tokio::test)]
    async fn start_returns_running_process() {
        let h = harness();
        let set: GpuSet = "0".parse().expect("should parse");
        let command = h.supervisor.build_command(&set, &model(), 8080, &[1.0]);

        let started = h
            .supervisor
            .start(&set, &command, 8080)
            .await
            .expect("start should succeed");

        assert!(h.table.is_alive(started.pid).await);
        assert!(started.process_start_time.is_some());
        assert_eq!(h.launcher.launched().len(), 1);
    }

    #[test(tokio::test)]
    async fn start_waits_for_health_then_times_out() {
        let h = harness();
        h.probe.set_healthy(8080, false);
        let set: GpuSet = "0".parse().expect("should parse");
        let command = h.supervisor.build_command(&set, &model(), 8080, &[1.0]);

        let err = h
            .supervisor
            .start(&set, &command, 8080)
            .await
            .expect_err("start should time out");

        assert!(matches!(err, LifecycleError::StartTimeout { .. }), "got {err}");
        assert!(h.table.alive_pids().is_empty(), "timed out process must be killed");
        assert!(h.probe.check_count() > 1, "startup should poll repeatedly");
    }

    #[test(tokio::test)]
    async fn start_fails_fast_when_process_exits() {
        let h = harness();
        h.launcher.set_behaviour(LaunchBehaviour::ExitImmediately);
        let set: GpuSet = "0".parse().expect("should parse");
        let command = h.supervisor.build_command(&set, &model(), 8080, &[1.0]);

        let begin = Instant::now();
        let err = h
            .supervisor
            .start(&set, &command, 8080)
            .await
            .expect_err("start should fail");

        assert!(matches!(err, LifecycleError::StartFailure { .. }), "got {err}");
        assert!(begin.elapsed() < Duration::from_millis(300));
    }

    #[test(tokio::test)]
    async fn spawn_error_is_start_failure() {
        let h = harness();
        h.launcher.set_behaviour(LaunchBehaviour::FailSpawn);
        let set: GpuSet = "0".parse().expect("should parse");
        let command = h.supervisor.build_command(&set, &model(), 8080, &[1.0]);

        let err = h
            .supervisor
            .start(&set, &command, 8080)
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, LifecycleError::StartFailure { .. }), "got {err}");
    }

    #[test(tokio::test)]
    async fn graceful_stop_uses_sigterm() {
        let h = harness();
        let pid = h.table.add_process("llama-server");

        let outcome = h.supervisor.stop(pid, true).await.expect("stop should succeed");

        assert_eq!(outcome, StopOutcome::Terminated);
        assert_eq!(h.table.signals(), vec![(pid, Signal::Terminate)]);
    }

    #[test(tokio::test)]
    async fn graceful_stop_escalates_to_kill() {
        let h = harness();
        let pid = h.table.add_process("llama-server");
        h.table.ignore_terminate(pid);

        let outcome = h.supervisor.stop(pid, true).await.expect("stop should succeed");

        assert_eq!(outcome, StopOutcome::Killed);
        assert_eq!(
            h.table.signals(),
            vec![(pid, Signal::Terminate), (pid, Signal::Kill)]
        );
    }

    #[test(tokio::test)]
    async fn stopping_missing_process_is_a_no_op() {
        let h = harness();

        let outcome = h.supervisor.stop(4242, true).await.expect("stop should succeed");

        assert_eq!(outcome, StopOutcome::AlreadyExited);
        assert!(h.table.signals().is_empty());
    }

    #[test(tokio::test)]
    async fn probe_reports_dead_process() {
        let h = harness();
        let set: GpuSet = "0".parse().expect("should parse");

        let err = h
            .supervisor
            .probe(&set, 4242, 8080)
            .await
            .expect_err("dead process should fail the probe");
        assert!(matches!(err, LifecycleError::HealthCheckFailure { .. }));
    }

    #[test(tokio::test)]
    async fn log_tail_is_capped() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let table = Arc::new(FakeProcessTable::new());
        let supervisor = ProcessSupervisor::new(
            SupervisorSettings {
                log_dir: Some(dir.path().to_path_buf()),
                ..SupervisorSettings::default()
            },
            Arc::new(FakeLauncher::new(table.clone())),
            table,
            Arc::new(FakeHealthProbe::new()),
        );
        let set: GpuSet = "0,1".parse().expect("should parse");
        assert_eq!(
            supervisor.tail_log(&set, 10).await.expect("should read"),
            Some(Vec::new()),
            "no output yet"
        );

        let path = supervisor.log_path(&set).expect("log dir is configured");
        assert_eq!(path, dir.path().join("inference-gpu0-1.log"));
        let body: String = (0..400).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, body).expect("should write log");

        let last = supervisor
            .tail_log(&set, 2)
            .await
            .expect("should read")
            .expect("log is captured");
        assert_eq!(last, vec!["line 398", "line 399"]);

        let capped = supervisor
            .tail_log(&set, 10_000)
            .await
            .expect("should read")
            .expect("log is captured");
        assert_eq!(capped.len(), MAX_LOG_LINES);
        assert_eq!(capped[0], "line 100");
    }

    #[test(tokio::test)]
    async fn uncaptured_output_has_no_log() {
        let h = harness();
        let set: GpuSet = "0".parse().expect("should parse");

        assert!(h.supervisor.log_path(&set).is_none());
        assert_eq!(h.supervisor.tail_log(&set, 5).await.expect("should not fail"), None);
    }
}
