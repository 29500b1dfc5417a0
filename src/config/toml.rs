//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, OrphanPolicy as CliOrphanPolicy};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file named on the command line, if any
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };

    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Override coordinator settings
    if let Some(listen) = &cli.listen {
        config.coordinator.listen = listen.clone();
    }
    if let Some(http_listen) = &cli.http_listen {
        config.coordinator.http_listen = http_listen.clone();
    }
    if let Some(hard_cap) = cli.hard_cap {
        config.coordinator.hard_cap = hard_cap;
    }
    if let Some(seconds) = cli.submit_timeout {
        config.coordinator.submit_timeout_secs = seconds;
    }
    if let Some(policy) = cli.orphan_policy {
        config.coordinator.orphan_policy = match policy {
            CliOrphanPolicy::Leave => OrphanPolicy::Leave,
            CliOrphanPolicy::Fail => OrphanPolicy::Fail,
            CliOrphanPolicy::Requeue => OrphanPolicy::Requeue,
        };
    }

    // Override registry settings
    if let Some(path) = &cli.registry {
        config.registry.path = Some(path.clone());
    }
    if cli.no_auto_approve {
        config.registry.auto_approve = false;
    }

    // Override worker settings
    if let Some(addr) = &cli.coordinator {
        config.worker.coordinator = addr.clone();
    }
    if let Some(path) = &cli.token_file {
        config.worker.token_path = path.clone();
    }
    if let Some(cpus) = cli.cpus {
        config.worker.cpu_count = Some(cpus);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_toml_basic() {
        let toml = r#"
[coordinator]
listen = "0.0.0.0:9000"
hard_cap = 4
orphan_policy = "requeue"

[registry]
path = "/var/lib/voicepool/workers.json"
auto_approve = false

[worker]
coordinator = "10.0.1.10:9000"
cpu_count = 2
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.coordinator.listen, "0.0.0.0:9000");
        assert_eq!(config.coordinator.hard_cap, 4);
        assert_eq!(config.coordinator.orphan_policy, OrphanPolicy::Requeue);
        // Unset fields keep their defaults
        assert_eq!(config.coordinator.http_listen, "0.0.0.0:7801");
        assert_eq!(config.registry.path, Some(PathBuf::from("/var/lib/voicepool/workers.json")));
        assert!(!config.registry.auto_approve);
        assert_eq!(config.worker.coordinator, "10.0.1.10:9000");
        assert_eq!(config.worker.cpu_count, Some(2));
    }

    #[test]
    fn test_parse_toml_empty() {
        let config = parse_toml_string("").unwrap();
        assert_eq!(config.coordinator.hard_cap, 8);
        assert!(config.registry.path.is_none());
    }

    #[test]
    fn test_parse_toml_rejects_unknown_policy() {
        assert!(parse_toml_string("[coordinator]\norphan_policy = \"retry\"\n").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator]\nhard_cap = 4\nlisten = \"0.0.0.0:9000\"").unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "voicepool",
            "--config",
            path.as_str(),
            "--hard-cap",
            "2",
            "--orphan-policy",
            "leave",
            "--no-auto-approve",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.coordinator.hard_cap, 2);
        assert_eq!(config.coordinator.listen, "0.0.0.0:9000");
        assert_eq!(config.coordinator.orphan_policy, OrphanPolicy::Leave);
        assert!(!config.registry.auto_approve);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = parse_toml_file(Path::new("/nonexistent/voicepool.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/voicepool.toml"));
    }
}
