//! Spawns inference servers with `tokio::process`.

use std::fs::OpenOptions;
use std::process::Stdio;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

use super::process_table::display_name;
use crate::domain::traits::ProcessError;
use crate::domain::traits::ProcessLauncher;
use crate::domain::types::LaunchCommand;

/// Launches servers in their own process group so terminal signals aimed at
/// the controller do not reach them, and reaps each child from a background
/// task. Children are not killed when the controller exits.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    fn output(command: &LaunchCommand) -> Result<(Stdio, Stdio), Report<ProcessError>> {
        let Some(path) = &command.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).change_context(ProcessError::Spawn {
                message: format!("cannot create log directory {}", parent.display()),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .change_context(ProcessError::Spawn {
                message: format!("cannot open log file {}", path.display()),
            })?;
        let stderr = file.try_clone().change_context(ProcessError::Spawn {
            message: format!("cannot duplicate log file {}", path.display()),
        })?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn spawn(&self, command: &LaunchCommand) -> Result<u32, Report<ProcessError>> {
        let (stdout, stderr) = Self::output(command)?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .change_context(ProcessError::Spawn {
                message: format!("cannot execute {}", command.program.display()),
            })?;

        let Some(pid) = child.id() else {
            return Err(Report::new(ProcessError::Spawn {
                message: "child exited before its pid could be read".to_string(),
            }));
        };
        let name = display_name(&command.program);
        info!(pid = pid, program = %name, log_file = ?command.log_file, "Spawned process");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid = pid, program = %name, status = %status, "Process exited"),
                Err(e) => warn!(pid = pid, program = %name, error = %e, "Failed to reap process"),
            }
        });
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use test_log::test;

    use super::*;
    use crate::domain::traits::ProcessTable;
    use crate::domain::types::Signal;
    use crate::infrastructure::process_table::ProcfsProcessTable;

    #[test(tokio::test)]
    async fn spawned_process_is_visible_and_reaped() {
        let launcher = TokioProcessLauncher::new();
        let table = ProcfsProcessTable::new();
        let dir = tempfile::tempdir().expect("should create temp dir");
        let command = LaunchCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            log_file: Some(dir.path().join("logs").join("sleep.log")),
        };

        let pid = launcher.spawn(&command).await.expect("should spawn sleep");
        assert!(table.is_alive(pid).await);
        assert!(dir.path().join("logs").join("sleep.log").exists());

        table.signal(pid, Signal::Kill).await.expect("should kill sleep");
        let mut reaped = false;
        for _ in 0..50 {
            if !table.is_alive(pid).await {
                reaped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(reaped, "killed child should be reaped by the background task");
    }

    #[test(tokio::test)]
    async fn missing_program_is_a_spawn_error() {
        let launcher = TokioProcessLauncher::new();
        let command = LaunchCommand {
            program: PathBuf::from("/nonexistent/llama-server"),
            args: Vec::new(),
            log_file: None,
        };

        let err = launcher.spawn(&command).await.expect_err("spawn should fail");
        assert!(matches!(err.current_context(), ProcessError::Spawn { .. }));
    }
}
