use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::OccupancyPolicy;
use crate::domain::PortPolicy;
use crate::domain::RestartPolicy;
use crate::domain::SupervisorSettings;

/// Settings shared by the daemon and the one-shot commands
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    #[arg(
        long,
        env = "LLAMA_MODELS_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "config/models.yaml",
        help = "Path to the YAML model catalog"
    )]
    pub models_config: PathBuf,

    #[arg(
        long,
        env = "LLAMA_REGISTRY_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "data/processes.json",
        help = "Registry document tracking running instances across restarts"
    )]
    pub registry_file: PathBuf,

    #[arg(
        long,
        env = "LLAMA_SERVER_EXECUTABLE",
        default_value = "llama-server",
        help = "Inference server executable, also the identity used for orphan detection"
    )]
    pub executable: String,

    #[arg(long, env = "LLAMA_HOST", default_value = "127.0.0.1", help = "Bind host for inference servers")]
    pub host: String,

    #[arg(long, env = "LLAMA_BASE_PORT", default_value = "8080", help = "Port of the instance on GPU 0")]
    pub base_port: u16,

    #[arg(long, default_value = "1", help = "Port distance between consecutive GPU indices")]
    pub port_stride: u16,

    #[arg(long, help = "Fixed port for instances spanning more than one GPU")]
    pub shared_port: Option<u16>,

    #[arg(
        long,
        env = "LLAMA_DEVICE_COUNT",
        help = "Number of GPUs to allocate from, detected through NVML when omitted"
    )]
    pub device_count: Option<u32>,

    #[arg(long, default_value = "60", help = "Seconds a new instance has to become healthy")]
    pub startup_timeout_secs: u64,

    #[arg(
        long,
        default_value = "500",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Initial delay between startup health probes in milliseconds, doubled after each miss"
    )]
    pub health_interval_ms: u64,

    #[arg(long, default_value = "5000", help = "Upper bound for the startup probe delay in milliseconds")]
    pub health_max_interval_ms: u64,

    #[arg(long, default_value = "2000", help = "Timeout of a single health request in milliseconds")]
    pub health_request_timeout_ms: u64,

    #[arg(
        long,
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between health probes of running instances"
    )]
    pub monitor_interval_secs: u64,

    #[arg(long, default_value = "3", help = "Consecutive failed probes before an instance counts as crashed")]
    pub crash_threshold: u32,

    #[arg(long, default_value = "10", help = "Seconds to wait after SIGTERM before SIGKILL")]
    pub stop_grace_secs: u64,

    #[arg(long, help = "Relaunch crashed instances with their original command")]
    pub restart_on_crash: bool,

    #[arg(long, default_value = "3", help = "Relaunch attempts before an instance is failed permanently")]
    pub max_restart_attempts: u32,

    #[arg(long, env = "LLAMA_DISABLE_TELEMETRY", help = "Do not query NVML for GPU memory")]
    pub disable_telemetry: bool,

    #[arg(
        long,
        env = "LLAMA_OCCUPANCY_THRESHOLD_MIB",
        default_value = "30",
        help = "Used memory in MiB above which a GPU without a managed instance counts as occupied"
    )]
    pub occupancy_threshold_mib: u64,

    #[arg(long, help = "Load onto GPUs even when unmanaged work occupies them")]
    pub allow_occupied_gpus: bool,

    #[arg(
        long,
        env = "LLAMA_SERVER_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory receiving one output log per GPU set, output is discarded when unset"
    )]
    pub server_log_dir: Option<PathBuf>,
}

impl ControllerArgs {
    pub fn port_policy(&self) -> PortPolicy {
        PortPolicy {
            base_port: self.base_port,
            port_stride: self.port_stride,
            shared_port: self.shared_port,
        }
    }

    pub fn occupancy_policy(&self) -> OccupancyPolicy {
        OccupancyPolicy::from_mib(self.occupancy_threshold_mib, !self.allow_occupied_gpus)
    }

    pub fn health_request_timeout(&self) -> Duration {
        Duration::from_millis(self.health_request_timeout_ms)
    }
}

impl From<&ControllerArgs> for SupervisorSettings {
    fn from(args: &ControllerArgs) -> Self {
        Self {
            executable: args.executable.clone(),
            host: args.host.clone(),
            log_dir: args.server_log_dir.clone(),
            startup_timeout: Duration::from_secs(args.startup_timeout_secs),
            health_interval: Duration::from_millis(args.health_interval_ms),
            health_max_interval: Duration::from_millis(
                args.health_max_interval_ms.max(args.health_interval_ms),
            ),
            monitor_interval: Duration::from_secs(args.monitor_interval_secs),
            crash_threshold: args.crash_threshold.max(1),
            stop_grace: Duration::from_secs(args.stop_grace_secs),
            restart: RestartPolicy {
                enabled: args.restart_on_crash,
                max_attempts: args.max_restart_attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        controller: ControllerArgs,
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = Harness::parse_from(["controller"]).controller;
        let settings = SupervisorSettings::from(&args);

        assert_eq!(args.registry_file, PathBuf::from("data/processes.json"));
        assert_eq!(args.port_policy(), PortPolicy::default());
        assert_eq!(settings.executable, "llama-server");
        assert_eq!(settings.startup_timeout, Duration::from_secs(60));
        assert_eq!(settings.health_interval, Duration::from_millis(500));
        assert_eq!(settings.crash_threshold, 3);
        assert!(!settings.restart.enabled);
        assert_eq!(args.occupancy_policy(), OccupancyPolicy::default());
    }

    #[test]
    fn occupancy_threshold_and_override() {
        let args = Harness::parse_from([
            "controller",
            "--occupancy-threshold-mib",
            "512",
            "--allow-occupied-gpus",
        ])
        .controller;

        let policy = args.occupancy_policy();
        assert_eq!(policy.threshold_bytes, 512 * 1024 * 1024);
        assert!(!policy.refuse_occupied);
    }

    #[test]
    fn shared_port_and_restart_policy() {
        let args = Harness::parse_from([
            "controller",
            "--base-port",
            "8081",
            "--port-stride",
            "7",
            "--shared-port",
            "8081",
            "--restart-on-crash",
            "--max-restart-attempts",
            "5",
        ])
        .controller;
        let settings = SupervisorSettings::from(&args);

        assert_eq!(args.port_policy().shared_port, Some(8081));
        assert_eq!(args.port_policy().port_stride, 7);
        assert!(settings.restart.enabled);
        assert_eq!(settings.restart.max_attempts, 5);
    }

    #[test]
    fn zero_monitor_interval_is_rejected() {
        assert!(Harness::try_parse_from(["controller", "--monitor-interval-secs", "0"]).is_err());
    }
}
