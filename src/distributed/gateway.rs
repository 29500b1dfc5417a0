//! Connection gateway
//!
//! Performs the one-shot handshake on a new inbound connection:
//! - Protocol version check
//! - Token format check
//! - Registry lookup (creating unseen identities)
//! - Approval check
//! - Capacity negotiation
//!
//! The worker is told `Success` or `Error: <reason>`. A rejected
//! connection is closed by the caller; nothing here can bring the
//! coordinator down.

use super::error::HandshakeError;
use super::protocol::{read_frame, write_frame, Handshake, HANDSHAKE_ERROR_PREFIX, HANDSHAKE_SUCCESS, PROTOCOL_VERSION};
use crate::config::CoordinatorConfig;
use crate::registry::{is_valid_token, token_prefix, WorkerIdentity, WorkerRegistry};
use tokio::io::{AsyncRead, AsyncWrite};

/// An accepted worker, ready to join the pool
#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: WorkerIdentity,
    pub handshake: Handshake,

    /// Negotiated capacity
    pub max_tasks: usize,

    /// Whether the identity was created by this handshake
    pub created: bool,
}

/// Parse the handshake record
pub fn parse_handshake(text: &str) -> Result<Handshake, HandshakeError> {
    serde_json::from_str(text).map_err(|e| HandshakeError::MalformedHandshake(e.to_string()))
}

/// Validate a handshake and negotiate capacity
///
/// Checks run in a fixed order (version, token format, registry, approval)
/// so an outdated worker is told to upgrade before anything else. The
/// registry lookup may touch the filesystem, so the async handshake runs
/// this on the blocking thread pool.
pub fn admit(registry: &WorkerRegistry, handshake: Handshake, hard_cap: usize) -> Result<Admission, HandshakeError> {
    if handshake.version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: handshake.version,
        });
    }

    if !is_valid_token(&handshake.token) {
        return Err(HandshakeError::TokenFormatError);
    }

    if handshake.cpu_count == 0 {
        return Err(HandshakeError::MalformedHandshake("cpu_count must be at least 1".to_string()));
    }

    let (identity, created) = registry.lookup_or_create(&handshake.token).map_err(|e| {
        tracing::error!(token = token_prefix(&handshake.token), "Registry lookup failed: {:#}", e);
        HandshakeError::RegistryUnavailable
    })?;

    if created {
        tracing::info!(token = identity.token_prefix(), approved = identity.approved, "Token created");
    }

    if !identity.approved {
        return Err(HandshakeError::NotApproved);
    }

    let max_tasks = handshake.cpu_count.min(hard_cap);

    Ok(Admission {
        identity,
        handshake,
        max_tasks,
        created,
    })
}

/// [`admit`] on the blocking thread pool
async fn admit_blocking(registry: &WorkerRegistry, handshake: Handshake, hard_cap: usize) -> Result<Admission, HandshakeError> {
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || admit(&registry, handshake, hard_cap))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Handshake validation task failed: {}", e);
            Err(HandshakeError::RegistryUnavailable)
        })
}

/// Run the handshake over a fresh connection
///
/// Reads the first frame (bounded by the configured timeout), validates it
/// and writes the reply. On rejection the reason has already been sent when
/// this returns.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    registry: &WorkerRegistry,
    config: &CoordinatorConfig,
) -> Result<Admission, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = match tokio::time::timeout(config.handshake_timeout(), read_frame(reader)).await {
        Ok(Ok(Some(text))) => Ok(text),
        Ok(Ok(None)) => Err(HandshakeError::ConnectionLost("closed before handshake".to_string())),
        Ok(Err(e)) => Err(HandshakeError::MalformedHandshake(format!("{e:#}"))),
        Err(_) => Err(HandshakeError::Timeout),
    };

    let outcome = match first.and_then(|text| parse_handshake(&text)) {
        Ok(hs) => admit_blocking(registry, hs, config.hard_cap).await,
        Err(e) => Err(e),
    };

    match &outcome {
        Ok(_) => {
            write_frame(writer, HANDSHAKE_SUCCESS)
                .await
                .map_err(|e| HandshakeError::ConnectionLost(format!("{e:#}")))?;
        }
        Err(HandshakeError::ConnectionLost(_)) => {}
        Err(e) => {
            let reply = format!("{HANDSHAKE_ERROR_PREFIX}{e}");
            if let Err(write_err) = write_frame(writer, &reply).await {
                tracing::debug!("Failed to send handshake rejection: {:#}", write_err);
            }
        }
    }

    outcome
}
