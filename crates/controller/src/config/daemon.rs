use clap::Parser;

use super::controller::ControllerArgs;

/// Instance to start when the daemon comes up, `<gpus>=<model>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preload {
    pub gpus: String,
    pub model_id: String,
}

fn parse_preload(raw: &str) -> Result<Preload, String> {
    let (gpus, model_id) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <gpus>=<model>, got '{raw}'"))?;
    let (gpus, model_id) = (gpus.trim(), model_id.trim());
    if gpus.is_empty() || model_id.is_empty() {
        return Err(format!("expected <gpus>=<model>, got '{raw}'"));
    }
    Ok(Preload {
        gpus: gpus.to_string(),
        model_id: model_id.to_string(),
    })
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[arg(
        long,
        value_parser = parse_preload,
        help = "Load a model at startup, e.g. --preload 0=qwen-coder --preload 1=llama3"
    )]
    pub preload: Vec<Preload>,

    #[arg(long, help = "Terminate untracked inference servers after registry recovery")]
    pub cleanup_orphans_on_start: bool,

    #[arg(long, help = "Stop all instances when the daemon exits instead of leaving them running")]
    pub stop_instances_on_exit: bool,

    #[arg(
        long,
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between retries of a failed registry write"
    )]
    pub registry_retry_secs: u64,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn preload_pairs_are_parsed() {
        let args = DaemonArgs::parse_from([
            "daemon",
            "--preload",
            "0,1=qwen",
            "--preload",
            " 2 = llama3 ",
        ]);
        assert_eq!(
            args.preload,
            vec![
                Preload {
                    gpus: "0,1".to_string(),
                    model_id: "qwen".to_string()
                },
                Preload {
                    gpus: "2".to_string(),
                    model_id: "llama3".to_string()
                },
            ]
        );
        assert!(!args.stop_instances_on_exit);
    }

    #[test]
    fn malformed_preload_is_rejected() {
        assert!(DaemonArgs::try_parse_from(["daemon", "--preload", "qwen"]).is_err());
        assert!(DaemonArgs::try_parse_from(["daemon", "--preload", "=qwen"]).is_err());
    }
}
