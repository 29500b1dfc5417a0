//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Coordinator mode (default) - accept workers and serve submissions
    Coordinator,
    /// Worker mode - connect to a coordinator and run its tasks
    Worker,
    /// Approve mode - approve or revoke worker tokens in the registry
    Approve,
}

/// What to do with tasks of a worker that disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrphanPolicy {
    Leave,
    Fail,
    Requeue,
}

/// voicepool - Capacity-aware task coordinator for speech analysis
#[derive(Parser, Debug)]
#[command(name = "voicepool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: coordinator, worker, or approve
    #[arg(long, value_enum, default_value = "coordinator")]
    pub mode: ExecutionMode,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long)]
    pub debug: bool,

    // === Coordinator Options ===
    /// Address workers connect to (e.g., 0.0.0.0:7800)
    #[arg(long)]
    pub listen: Option<String>,

    /// Address of the HTTP submission surface (e.g., 0.0.0.0:7801)
    #[arg(long)]
    pub http_listen: Option<String>,

    /// Maximum concurrent tasks per worker
    #[arg(long)]
    pub hard_cap: Option<usize>,

    /// Fate of running tasks when their worker disconnects
    #[arg(long, value_enum)]
    pub orphan_policy: Option<OrphanPolicy>,

    /// Seconds an HTTP submission waits for its result
    #[arg(long)]
    pub submit_timeout: Option<u64>,

    // === Registry Options ===
    /// JSON file holding worker identities
    #[arg(long, env = "VOICEPOOL_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Leave new worker tokens unapproved until approved explicitly
    #[arg(long)]
    pub no_auto_approve: bool,

    // === Worker Options ===
    /// Coordinator address (worker mode only)
    #[arg(long, env = "VOICEPOOL_COORDINATOR")]
    pub coordinator: Option<String>,

    /// Token file (worker mode only, generated if missing)
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// CPU count to advertise instead of the detected one (worker mode only)
    #[arg(long)]
    pub cpus: Option<usize>,

    // === Approve Options ===
    /// Prefix of the token to approve (approve mode only, lists tokens when omitted)
    #[arg(long)]
    pub token_prefix: Option<String>,

    /// Revoke approval instead of granting it (approve mode only)
    #[arg(long)]
    pub revoke: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hard_cap == Some(0) {
            anyhow::bail!("hard_cap must be at least 1");
        }

        if self.cpus == Some(0) {
            anyhow::bail!("cpus must be at least 1");
        }

        if self.submit_timeout == Some(0) {
            anyhow::bail!("submit_timeout must be greater than 0");
        }

        if let Some(prefix) = &self.token_prefix {
            if self.mode != ExecutionMode::Approve {
                anyhow::bail!("--token-prefix is only valid in approve mode");
            }
            if prefix.is_empty() {
                anyhow::bail!("--token-prefix must not be empty");
            }
        }

        if self.revoke && self.token_prefix.is_none() {
            anyhow::bail!("--revoke requires --token-prefix");
        }

        if self.mode == ExecutionMode::Approve && self.registry.is_none() && self.config.is_none() {
            anyhow::bail!("approve mode needs a persistent registry (--registry or --config)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("voicepool").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_mode_is_coordinator() {
        let cli = parse(&[]);
        assert_eq!(cli.mode, ExecutionMode::Coordinator);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_worker_flags() {
        let cli = parse(&["--mode", "worker", "--coordinator", "10.0.1.10:7800", "--cpus", "4"]);
        assert_eq!(cli.mode, ExecutionMode::Worker);
        assert_eq!(cli.coordinator.as_deref(), Some("10.0.1.10:7800"));
        assert_eq!(cli.cpus, Some(4));
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        assert!(parse(&["--hard-cap", "0"]).validate().is_err());
        assert!(parse(&["--mode", "worker", "--cpus", "0"]).validate().is_err());
    }

    #[test]
    fn test_validate_approve_mode() {
        assert!(parse(&["--token-prefix", "ABC"]).validate().is_err());
        assert!(parse(&["--mode", "approve", "--token-prefix", "ABC"]).validate().is_err());
        assert!(parse(&["--mode", "approve", "--registry", "workers.json", "--token-prefix", "ABC"])
            .validate()
            .is_ok());
        assert!(parse(&["--mode", "approve", "--registry", "workers.json", "--revoke"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_orphan_policy_values() {
        let cli = parse(&["--orphan-policy", "requeue"]);
        assert_eq!(cli.orphan_policy, Some(OrphanPolicy::Requeue));
        assert!(Cli::try_parse_from(["voicepool", "--orphan-policy", "retry"]).is_err());
    }
}
