//! voicepool CLI entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voicepool::config::cli::{Cli, ExecutionMode};
use voicepool::config::{toml::load_config, validator::validate_config, Config};
use voicepool::distributed::{Coordinator, EchoHandler, NodeService};

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();
    cli.validate()?;

    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    validate_config(&config).context("Configuration validation failed")?;

    tracing::info!("voicepool v{}", env!("CARGO_PKG_VERSION"));

    // Handle different execution modes
    match cli.mode {
        ExecutionMode::Coordinator => run_coordinator(config),
        ExecutionMode::Worker => run_worker(config),
        ExecutionMode::Approve => run_approve(&cli, &config),
    }
}

/// Install the log subscriber; RUST_LOG wins over `--debug`
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run in coordinator mode
fn run_coordinator(config: Config) -> Result<()> {
    let registry = config.registry.open().context("Failed to open worker registry")?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    tracing::info!(
        hard_cap = config.coordinator.hard_cap,
        orphan_policy = %config.coordinator.orphan_policy,
        auto_approve = registry.auto_approve(),
        "Coordinator starting"
    );

    runtime.block_on(async {
        let coordinator = Coordinator::new(config.coordinator.clone(), registry);
        let _keepalive = coordinator.spawn_keepalive();

        tokio::select! {
            result = coordinator.serve(&config.coordinator.listen) => result,
            result = voicepool::http::serve(&config.coordinator.http_listen, coordinator.clone()) => result,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutting down");
                Ok(())
            }
        }
    })
}

/// Run in worker mode
fn run_worker(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let service = NodeService::new(config.worker, Arc::new(EchoHandler))
            .context("Failed to create node service")?;

        service.run().await
    })
}

/// Approve or revoke tokens, or list them when no prefix is given
fn run_approve(cli: &Cli, config: &Config) -> Result<()> {
    let registry = config.registry.open().context("Failed to open worker registry")?;

    let Some(prefix) = &cli.token_prefix else {
        let identities = registry.list()?;
        if identities.is_empty() {
            println!("No workers registered");
        }
        for identity in identities {
            println!(
                "{}  approved={:<5}  trusted={:<5}  {}  {}",
                identity.token_prefix(),
                identity.approved,
                identity.trusted,
                identity.created.format("%Y-%m-%d %H:%M:%S"),
                identity.nickname,
            );
        }
        return Ok(());
    };

    let approved = !cli.revoke;
    let count = registry.set_approved(prefix, approved)?;
    if count == 0 {
        anyhow::bail!("No worker token starts with {}", prefix);
    }

    println!(
        "{} {} worker token(s)",
        if approved { "Approved" } else { "Revoked" },
        count
    );
    Ok(())
}
