//! Identity persistence backends

use super::WorkerIdentity;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key-value persistence for worker identities, keyed by token
pub trait IdentityStore: Send + Sync {
    /// Fetch the identity for a token
    fn get(&self, token: &str) -> Result<Option<WorkerIdentity>>;

    /// Insert an identity unless its token is already present
    ///
    /// Returns the stored identity and whether this call inserted it. The
    /// check and the insert happen atomically.
    fn insert_if_absent(&self, identity: WorkerIdentity) -> Result<(WorkerIdentity, bool)>;

    /// Overwrite an existing identity
    fn update(&self, identity: WorkerIdentity) -> Result<()>;

    /// All stored identities
    fn list(&self) -> Result<Vec<WorkerIdentity>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store, contents are lost on restart
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: Mutex<HashMap<String, WorkerIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, token: &str) -> Result<Option<WorkerIdentity>> {
        Ok(lock(&self.records).get(token).cloned())
    }

    fn insert_if_absent(&self, identity: WorkerIdentity) -> Result<(WorkerIdentity, bool)> {
        let mut records = lock(&self.records);
        if let Some(existing) = records.get(&identity.token) {
            return Ok((existing.clone(), false));
        }
        records.insert(identity.token.clone(), identity.clone());
        Ok((identity, true))
    }

    fn update(&self, identity: WorkerIdentity) -> Result<()> {
        lock(&self.records).insert(identity.token.clone(), identity);
        Ok(())
    }

    fn list(&self) -> Result<Vec<WorkerIdentity>> {
        let mut all: Vec<_> = lock(&self.records).values().cloned().collect();
        all.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(all)
    }
}

/// JSON file store
///
/// The file is the only source of truth: every operation re-reads it, so
/// changes made by another process (an approval run, for instance) are
/// seen immediately and never overwritten. Writes go to a sibling temp
/// file that is renamed into place. Nothing is cached, so a failed write
/// leaves no trace of the change.
#[derive(Debug)]
pub struct JsonFileIdentityStore {
    path: PathBuf,

    /// Serializes read-modify-write cycles within this process
    file_lock: Mutex<()>,
}

impl JsonFileIdentityStore {
    /// Open a store, creating an empty one if the file does not exist
    ///
    /// An existing file is parsed once up front so a corrupt registry is
    /// reported at startup.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            file_lock: Mutex::new(()),
        };
        store.load()?;
        Ok(store)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, WorkerIdentity>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read identity store: {}", self.path.display())
                })
            }
        };

        let list: Vec<WorkerIdentity> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity store: {}", self.path.display()))?;
        Ok(list.into_iter().map(|i| (i.token.clone(), i)).collect())
    }

    fn persist(&self, records: &BTreeMap<String, WorkerIdentity>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let list: Vec<&WorkerIdentity> = records.values().collect();
        let content = serde_json::to_string_pretty(&list)
            .context("Failed to serialize identities")?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write identity store: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace identity store: {}", self.path.display()))?;

        Ok(())
    }
}

impl IdentityStore for JsonFileIdentityStore {
    fn get(&self, token: &str) -> Result<Option<WorkerIdentity>> {
        let _guard = lock(&self.file_lock);
        Ok(self.load()?.remove(token))
    }

    fn insert_if_absent(&self, identity: WorkerIdentity) -> Result<(WorkerIdentity, bool)> {
        let _guard = lock(&self.file_lock);
        let mut records = self.load()?;
        if let Some(existing) = records.get(&identity.token) {
            return Ok((existing.clone(), false));
        }
        records.insert(identity.token.clone(), identity.clone());
        self.persist(&records)?;
        Ok((identity, true))
    }

    fn update(&self, identity: WorkerIdentity) -> Result<()> {
        let _guard = lock(&self.file_lock);
        let mut records = self.load()?;
        records.insert(identity.token.clone(), identity);
        self.persist(&records)
    }

    fn list(&self) -> Result<Vec<WorkerIdentity>> {
        let _guard = lock(&self.file_lock);
        let mut all: Vec<_> = self.load()?.into_values().collect();
        all.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(all)
    }
}
