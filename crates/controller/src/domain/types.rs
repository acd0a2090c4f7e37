//! Value types shared by the supervisor, registry and orchestrator.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Catalog entry for a model the controller can launch. Read-only reference
/// data owned by the model catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub parameters: LaunchParameters,
}

/// Optional inference server flags for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchParameters {
    pub ctx_size: Option<u32>,
    pub n_gpu_layers: Option<i32>,
    pub threads: Option<u32>,
    pub batch_size: Option<u32>,
    /// Appended verbatim after the generated flags
    pub extra_args: Vec<String>,
}

/// Program plus argument vector for one inference server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File receiving the server's stdout and stderr
    pub log_file: Option<PathBuf>,
}

impl LaunchCommand {
    /// Rebuild a command from a persisted argv (`argv[0]` is the program).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            log_file: None,
        })
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// What the OS reports about a pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Short command name (`/proc/<pid>/comm`), truncated to 15 bytes by Linux
    pub name: String,
    pub exe: Option<PathBuf>,
    /// Clock ticks since boot at which the process started
    pub start_time: Option<u64>,
}

/// Linux truncates `comm` to this many bytes.
const COMM_MAX_LEN: usize = 15;

impl ProcessIdentity {
    /// Whether this process looks like an instance of `executable`.
    ///
    /// Compares case-insensitively against the file name of `executable`,
    /// accepting either the command name or the resolved executable path.
    pub fn matches_executable(&self, executable: &str) -> bool {
        let expected = Path::new(executable)
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| executable.to_lowercase());
        if expected.is_empty() {
            return false;
        }

        let name = self.name.to_lowercase();
        if name.contains(&expected)
            || (name.len() >= COMM_MAX_LEN && expected.starts_with(&name))
        {
            return true;
        }

        self.exe
            .as_deref()
            .and_then(Path::file_name)
            .map(|exe| exe.to_string_lossy().to_lowercase().contains(&expected))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to do, the pid was already gone
    AlreadyExited,
    /// Exited within the grace period after SIGTERM
    Terminated,
    /// Needed SIGKILL
    Killed,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn identity(name: &str, exe: Option<&str>) -> ProcessIdentity {
        ProcessIdentity {
            pid: 100,
            name: name.to_string(),
            exe: exe.map(PathBuf::from),
            start_time: None,
        }
    }

    #[test]
    fn matches_by_comm_name() {
        assert!(identity("llama-server", None).matches_executable("llama-server"));
        assert!(identity("Llama-Server", None).matches_executable("/opt/llama/llama-server"));
        assert!(!identity("python3", None).matches_executable("llama-server"));
    }

    #[test]
    fn matches_truncated_comm() {
        let id = identity("llama-server-cu", None);
        assert!(id.matches_executable("llama-server-cuda12"));
    }

    #[test]
    fn falls_back_to_exe_path() {
        let id = identity("main", Some("/opt/bin/llama-server (deleted)"));
        assert!(id.matches_executable("llama-server"));
        assert!(!identity("main", Some("/usr/bin/bash")).matches_executable("llama-server"));
    }

    #[test]
    fn argv_round_trips_through_from_argv() {
        let command = LaunchCommand {
            program: PathBuf::from("/usr/bin/llama-server"),
            args: vec!["-m".to_string(), "/m.gguf".to_string()],
            log_file: None,
        };
        let argv = command.argv();
        assert_eq!(argv[0], "/usr/bin/llama-server");
        assert_eq!(LaunchCommand::from_argv(&argv), Some(command));
        assert_eq!(LaunchCommand::from_argv(&[]), None);
    }

    #[test]
    fn parameters_default_when_missing() {
        let spec: ModelSpec = serde_yaml::from_str("id: a\nname: A\npath: /a.gguf\n")
            .expect("should parse minimal model");
        assert_eq!(spec.parameters, LaunchParameters::default());
    }
}
