//! Worker identity registry
//!
//! Every worker is identified by a long-lived bearer token. The registry
//! looks identities up on first contact and creates them when unseen;
//! identities are never deleted here. Persistence is injected through the
//! [`IdentityStore`] trait so the registry can run against an in-memory map
//! in tests and a JSON file in production.

pub mod store;

use crate::distributed::protocol::TOKEN_LENGTH;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use store::{IdentityStore, JsonFileIdentityStore, MemoryIdentityStore};

/// Characters a token may contain
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Offset into the token where default nicknames start
const NICKNAME_OFFSET: usize = 16;

/// Longest nickname the registry stores
const MAX_NICKNAME_LEN: usize = 255;

/// Persisted identity of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Bearer token, the primary credential
    pub token: String,

    /// Only approved workers are admitted
    pub approved: bool,

    /// Whether the worker is fully trusted
    #[serde(default)]
    pub trusted: bool,

    /// Human-readable name shown in introspection
    #[serde(default)]
    pub nickname: String,

    /// When the identity was first seen
    pub created: DateTime<Utc>,
}

impl WorkerIdentity {
    /// Create a fresh identity for a token
    pub fn new(token: impl Into<String>, approved: bool) -> Self {
        Self {
            token: token.into(),
            approved,
            trusted: false,
            nickname: String::new(),
            created: Utc::now(),
        }
    }

    /// First characters of the token, safe to print in logs
    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.token)
    }
}

/// Registry of worker identities over an injectable store
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn IdentityStore>,

    /// Approval state given to identities created on first contact
    auto_approve: bool,
}

impl WorkerRegistry {
    /// Create a registry over a store
    pub fn new(store: Arc<dyn IdentityStore>, auto_approve: bool) -> Self {
        Self { store, auto_approve }
    }

    /// Create a registry backed by an in-memory store
    pub fn in_memory(auto_approve: bool) -> Self {
        Self::new(Arc::new(MemoryIdentityStore::new()), auto_approve)
    }

    /// Approval state new identities receive
    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// Look up the identity for a token, creating it if unseen
    ///
    /// Returns the identity and whether it was created by this call. An
    /// empty nickname is replaced by a suffix of the token and persisted.
    pub fn lookup_or_create(&self, token: &str) -> Result<(WorkerIdentity, bool)> {
        let (mut identity, created) = match self.store.get(token)? {
            Some(identity) => (identity, false),
            None => {
                self.store.insert_if_absent(WorkerIdentity::new(token, self.auto_approve))?
            }
        };

        if identity.nickname.is_empty() {
            identity.nickname = default_nickname(token);
            self.store.update(identity.clone())?;
        }

        Ok((identity, created))
    }

    /// Approve or revoke every identity whose token starts with `prefix`
    ///
    /// Returns the number of identities changed.
    pub fn set_approved(&self, prefix: &str, approved: bool) -> Result<usize> {
        let mut changed = 0;
        for mut identity in self.store.list()? {
            if identity.token.starts_with(prefix) && identity.approved != approved {
                identity.approved = approved;
                self.store.update(identity)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// All known identities
    pub fn list(&self) -> Result<Vec<WorkerIdentity>> {
        self.store.list()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("auto_approve", &self.auto_approve)
            .finish_non_exhaustive()
    }
}

/// Check a token against the fixed-length `[A-Z0-9]` format
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && token.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Nickname given to a worker that has none
pub fn default_nickname(token: &str) -> String {
    token
        .chars()
        .skip(NICKNAME_OFFSET)
        .take(MAX_NICKNAME_LEN)
        .collect()
}

/// Generate a new random token
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Loggable prefix of a token
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(NICKNAME_OFFSET)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_valid() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(is_valid_token(&token));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_token_format() {
        assert!(!is_valid_token("ABC"));
        assert!(!is_valid_token(&"a".repeat(TOKEN_LENGTH)));
        assert!(!is_valid_token(&"A".repeat(TOKEN_LENGTH + 1)));
        assert!(is_valid_token(&"Z9".repeat(TOKEN_LENGTH / 2)));
    }

    #[test]
    fn test_default_nickname_is_token_suffix() {
        let token = generate_token();
        let nickname = default_nickname(&token);
        assert_eq!(nickname.len(), MAX_NICKNAME_LEN);
        assert_eq!(&token[16..16 + MAX_NICKNAME_LEN], nickname);
        assert_eq!(default_nickname("SHORT"), "");
    }

    #[test]
    fn test_lookup_creates_once() {
        let registry = WorkerRegistry::in_memory(true);
        let token = generate_token();

        let (first, created) = registry.lookup_or_create(&token).unwrap();
        assert!(created);
        assert!(first.approved);
        assert_eq!(first.nickname, default_nickname(&token));

        let (second, created) = registry.lookup_or_create(&token).unwrap();
        assert!(!created);
        assert_eq!(second.created, first.created);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_manual_approval() {
        let registry = WorkerRegistry::in_memory(false);
        assert!(!registry.auto_approve());
        let token = generate_token();

        let (identity, _) = registry.lookup_or_create(&token).unwrap();
        assert!(!identity.approved);

        assert_eq!(registry.set_approved(identity.token_prefix(), true).unwrap(), 1);
        assert_eq!(registry.set_approved(identity.token_prefix(), true).unwrap(), 0);

        let (identity, _) = registry.lookup_or_create(&token).unwrap();
        assert!(identity.approved);
    }

    #[test]
    fn test_approval_from_another_registry_is_seen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workers.json");
        let open = || {
            let store = JsonFileIdentityStore::open(&path).unwrap();
            WorkerRegistry::new(Arc::new(store), false)
        };
        let coordinator = open();
        let approver = open();
        let token = generate_token();

        let (identity, _) = coordinator.lookup_or_create(&token).unwrap();
        assert!(!identity.approved);

        assert_eq!(approver.set_approved(identity.token_prefix(), true).unwrap(), 1);

        let (identity, created) = coordinator.lookup_or_create(&token).unwrap();
        assert!(!created);
        assert!(identity.approved);

        coordinator.lookup_or_create(&generate_token()).unwrap();
        let approved: Vec<_> = approver.list().unwrap().into_iter().filter(|i| i.approved).collect();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].token, token);
    }
}
