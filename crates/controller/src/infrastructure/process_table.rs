//! Procfs-backed process table.
//!
//! Reads process identity from `/proc/<pid>/{comm,exe,stat}` and delivers
//! signals with `kill(2)`. Liveness is `kill(pid, 0)`, with zombies reported
//! as dead since they no longer hold GPU memory.
//!
//! # Key Components
//!
//! - [`ProcfsProcessTable`]: the [`ProcessTable`] implementation used in production
//! - [`parse_stat`]: extraction of state and start time from `/proc/<pid>/stat`

use std::io;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use crate::domain::traits::ProcessError;
use crate::domain::traits::ProcessTable;
use crate::domain::types::ProcessIdentity;
use crate::domain::types::Signal;

/// Fields of `/proc/<pid>/stat` the controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFields {
    /// One-letter process state (`R`, `S`, `Z`, ...)
    pub state: char,
    /// Field 22, clock ticks since boot at process start
    pub start_time: u64,
}

/// Parse `/proc/<pid>/stat`.
///
/// The command name (field 2) is wrapped in parentheses and may itself
/// contain spaces or parentheses, so fields are counted from the last `)`.
pub fn parse_stat(raw: &str) -> Option<StatFields> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); start time is field 22
    let state = fields.first()?.chars().next()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some(StatFields { state, start_time })
}

#[derive(Debug, Clone)]
pub struct ProcfsProcessTable {
    proc_root: PathBuf,
}

impl Default for ProcfsProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProcessTable {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Convert to a signal target. Pid 0 and values beyond `i32::MAX` would
    /// address process groups, so they are refused outright.
    fn target(pid: u32) -> Option<libc::pid_t> {
        match libc::pid_t::try_from(pid) {
            Ok(target) if target > 0 => Some(target),
            _ => None,
        }
    }

    async fn read_stat(&self, pid: u32) -> Option<StatFields> {
        let raw = fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat"))
            .await
            .ok()?;
        parse_stat(&raw)
    }

    /// Numeric entries of the proc root.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::ProcRead`] if the directory cannot be listed
    async fn list_pids(&self) -> Result<Vec<u32>, Report<ProcessError>> {
        let mut dir = fs::read_dir(&self.proc_root).await.map_err(|e| {
            Report::new(ProcessError::ProcRead {
                message: format!("Cannot read {}: {e}", self.proc_root.display()),
            })
        })?;

        let mut pids = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(Report::new(ProcessError::ProcRead {
                        message: format!("Cannot read {} entry: {e}", self.proc_root.display()),
                    }));
                }
            };
            if let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                pids.push(pid);
            }
        }
        Ok(pids)
    }
}

#[async_trait]
impl ProcessTable for ProcfsProcessTable {
    async fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = Self::target(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs the permission and existence check only
        let exists = unsafe { libc::kill(target, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        if !exists {
            return false;
        }
        !matches!(self.read_stat(pid).await, Some(StatFields { state: 'Z', .. }))
    }

    async fn identity(&self, pid: u32) -> Option<ProcessIdentity> {
        let base = self.proc_root.join(pid.to_string());
        let name = fs::read_to_string(base.join("comm")).await.ok()?;
        // exe is unreadable for other users' processes; comm still identifies them
        let exe = fs::read_link(base.join("exe")).await.ok();
        let start_time = self.read_stat(pid).await.map(|stat| stat.start_time);
        Some(ProcessIdentity {
            pid,
            name: name.trim_end().to_string(),
            exe,
            start_time,
        })
    }

    async fn find_by_name(&self, executable: &str) -> Result<Vec<u32>, Report<ProcessError>> {
        let mut matches = Vec::new();
        for pid in self.list_pids().await? {
            // processes may exit between listing and inspection
            let Some(identity) = self.identity(pid).await else {
                continue;
            };
            if identity.matches_executable(executable) && self.is_alive(pid).await {
                matches.push(pid);
            }
        }
        debug!(executable = %executable, found = matches.len(), "Completed proc filesystem scan");
        Ok(matches)
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), Report<ProcessError>> {
        let Some(target) = Self::target(pid) else {
            return Err(Report::new(ProcessError::NotFound { pid }));
        };
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };

        // SAFETY: target is a positive pid, never a process group
        if unsafe { libc::kill(target, signo) } == 0 {
            debug!(pid = pid, signal = ?signal, "Signal delivered");
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(Report::new(ProcessError::NotFound { pid }));
        }
        warn!(pid = pid, signal = ?signal, error = %err, "Failed to deliver signal");
        Err(Report::new(ProcessError::Signal {
            pid,
            message: err.to_string(),
        }))
    }
}

/// File name of a path, for log output.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn parse_stat_handles_spaces_in_comm() {
        let raw = "4242 (llama server) S 1 4242 4242 0 -1 4194560 1234 0 0 0 \
                   10 5 0 0 20 0 12 0 987654 123456789 2048 18446744073709551615";
        let stat = parse_stat(raw).expect("should parse stat line");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.start_time, 987654);
    }

    #[test]
    fn parse_stat_handles_parentheses_in_comm() {
        let raw = "7 (a) b) Z 1 7 7 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 55 0 0";
        let stat = parse_stat(raw).expect("should parse stat line");
        assert_eq!(stat.state, 'Z');
        assert_eq!(stat.start_time, 55);
    }

    #[test]
    fn parse_stat_rejects_truncated_line() {
        assert_eq!(parse_stat("12 (x) S 1 2"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test(tokio::test)]
    async fn own_process_is_alive_and_identified() {
        let table = ProcfsProcessTable::new();
        let pid = std::process::id();

        assert!(table.is_alive(pid).await);
        let identity = table.identity(pid).await.expect("own process should be readable");
        assert_eq!(identity.pid, pid);
        assert!(!identity.name.is_empty());
        assert!(identity.start_time.is_some());
    }

    #[test(tokio::test)]
    async fn group_pids_are_never_signalled() {
        let table = ProcfsProcessTable::new();

        assert!(!table.is_alive(0).await);
        let err = table
            .signal(0, Signal::Kill)
            .await
            .expect_err("pid 0 must be refused");
        assert!(matches!(err.current_context(), ProcessError::NotFound { pid: 0 }));
        assert!(table.signal(u32::MAX, Signal::Kill).await.is_err());
    }

    #[test(tokio::test)]
    async fn finds_own_process_by_name() {
        let table = ProcfsProcessTable::new();
        let own = table
            .identity(std::process::id())
            .await
            .expect("own process should be readable");

        let pids = table.find_by_name(&own.name).await.expect("scan should succeed");
        assert!(pids.contains(&std::process::id()));
    }

    #[test]
    fn display_name_uses_file_name() {
        assert_eq!(display_name(Path::new("/usr/bin/llama-server")), "llama-server");
    }
}
