//! Configuration validation

use super::*;
use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_coordinator(&config.coordinator)?;
    validate_worker(&config.worker)?;

    Ok(())
}

/// Validate coordinator configuration
pub fn validate_coordinator(coordinator: &CoordinatorConfig) -> Result<()> {
    let listen: SocketAddr = coordinator.listen.parse()
        .with_context(|| format!("Invalid coordinator.listen address: {}", coordinator.listen))?;
    let http_listen: SocketAddr = coordinator.http_listen.parse()
        .with_context(|| format!("Invalid coordinator.http_listen address: {}", coordinator.http_listen))?;

    if listen.port() != 0 && listen.port() == http_listen.port() {
        anyhow::bail!(
            "coordinator.listen and coordinator.http_listen must use different ports (both {})",
            listen.port()
        );
    }

    if coordinator.hard_cap == 0 {
        anyhow::bail!("coordinator.hard_cap must be at least 1");
    }

    if coordinator.handshake_timeout_secs == 0 {
        anyhow::bail!("coordinator.handshake_timeout_secs must be greater than 0");
    }

    if coordinator.keepalive_interval_secs == 0 {
        anyhow::bail!("coordinator.keepalive_interval_secs must be greater than 0");
    }

    if coordinator.submit_timeout_secs == 0 {
        anyhow::bail!("coordinator.submit_timeout_secs must be greater than 0");
    }

    if coordinator.hard_cap > 256 {
        tracing::warn!(
            "Very high hard_cap ({}), workers may be overloaded",
            coordinator.hard_cap
        );
    }

    Ok(())
}

/// Validate worker node configuration
pub fn validate_worker(worker: &WorkerNodeConfig) -> Result<()> {
    if worker.coordinator.trim().is_empty() {
        anyhow::bail!("worker.coordinator must not be empty");
    }

    if worker.cpu_count == Some(0) {
        anyhow::bail!("worker.cpu_count must be at least 1 if specified");
    }

    if worker.token_path.as_os_str().is_empty() {
        anyhow::bail!("worker.token_path must not be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_ports_differ() {
        let mut coordinator = CoordinatorConfig::default();
        coordinator.http_listen = "127.0.0.1:7800".to_string();
        assert!(validate_coordinator(&coordinator).is_err());

        coordinator.http_listen = "not an address".to_string();
        assert!(validate_coordinator(&coordinator).is_err());
    }

    #[test]
    fn test_validate_intervals() {
        let mut coordinator = CoordinatorConfig::default();
        coordinator.hard_cap = 0;
        assert!(validate_coordinator(&coordinator).is_err());

        let mut coordinator = CoordinatorConfig::default();
        coordinator.keepalive_interval_secs = 0;
        assert!(validate_coordinator(&coordinator).is_err());

        let mut coordinator = CoordinatorConfig::default();
        coordinator.handshake_timeout_secs = 0;
        assert!(validate_coordinator(&coordinator).is_err());
    }

    #[test]
    fn test_validate_worker() {
        let mut worker = WorkerNodeConfig::default();
        assert!(validate_worker(&worker).is_ok());

        worker.cpu_count = Some(0);
        assert!(validate_worker(&worker).is_err());

        worker.cpu_count = None;
        worker.coordinator = " ".to_string();
        assert!(validate_worker(&worker).is_err());
    }
}
