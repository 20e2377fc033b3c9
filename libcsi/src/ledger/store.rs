//! Backing stores for ledger entries.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::debug;

use super::LedgerEntry;
use crate::error::CsiError;

/// Keyed storage of [`LedgerEntry`] values with optimistic concurrency.
///
/// Every successful write bumps `resource_version`.  `create` on an existing
/// key and `update` carrying a stale version fail with
/// [`CsiError::Conflict`]; `update` of a missing key fails with
/// [`CsiError::NotFound`].  Stores never retry.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LedgerEntry>, CsiError>;

    async fn create(&self, entry: LedgerEntry) -> Result<LedgerEntry, CsiError>;

    async fn update(&self, entry: LedgerEntry) -> Result<LedgerEntry, CsiError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), CsiError>;
}

fn conflict(entry: &LedgerEntry, why: &str) -> CsiError {
    CsiError::Conflict(format!("{}/{}: {why}", entry.namespace, entry.name))
}

fn missing(entry: &LedgerEntry) -> CsiError {
    CsiError::NotFound(format!("{}/{} not found", entry.namespace, entry.name))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store.  Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntryStore {
    entries: Arc<DashMap<(String, String), LedgerEntry>>,
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LedgerEntry>, CsiError> {
        Ok(self
            .entries
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|e| e.value().clone()))
    }

    async fn create(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, CsiError> {
        match self.entries.entry((entry.namespace.clone(), entry.name.clone())) {
            Entry::Occupied(_) => Err(conflict(&entry, "already exists")),
            Entry::Vacant(slot) => {
                entry.resource_version = 1;
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn update(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, CsiError> {
        let key = (entry.namespace.clone(), entry.name.clone());
        let Some(mut current) = self.entries.get_mut(&key) else {
            return Err(missing(&entry));
        };
        if current.resource_version != entry.resource_version {
            return Err(conflict(&entry, "the object has been modified"));
        }
        entry.resource_version += 1;
        *current = entry.clone();
        Ok(entry)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), CsiError> {
        self.entries.remove(&(namespace.to_owned(), name.to_owned()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// On disk
// ---------------------------------------------------------------------------

/// One JSON document per entry at `<root>/<namespace>/<name>.json`.
///
/// Documents are replaced atomically through a rename.  Version checks are
/// serialised within one store instance; separate processes sharing a root
/// are only protected on `create`.
#[derive(Debug)]
pub struct FileEntryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEntryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, namespace: &str, name: &str) -> Result<PathBuf, CsiError> {
        for part in [namespace, name] {
            if part.is_empty() || part.contains('/') || part == "." || part == ".." {
                return Err(CsiError::InvalidArgument(format!(
                    "invalid ledger key component {part:?}"
                )));
            }
        }
        Ok(self.root.join(namespace).join(format!("{name}.json")))
    }

    async fn read(path: &Path) -> Result<Option<LedgerEntry>, CsiError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CsiError::internal(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CsiError::internal(format!("decode {}: {e}", path.display())))
    }

    /// Write `entry` next to `path` under a unique temporary name.
    async fn write_temp(path: &Path, entry: &LedgerEntry) -> Result<PathBuf, CsiError> {
        let dir = path
            .parent()
            .ok_or_else(|| CsiError::internal(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CsiError::internal(format!("create {}: {e}", dir.display())))?;

        let tmp = dir.join(format!(".{}.{}.tmp", entry.name, uuid::Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(entry).map_err(CsiError::internal)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| CsiError::internal(format!("write {}: {e}", tmp.display())))?;
        Ok(tmp)
    }
}

#[async_trait]
impl EntryStore for FileEntryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LedgerEntry>, CsiError> {
        Self::read(&self.path(namespace, name)?).await
    }

    async fn create(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, CsiError> {
        let path = self.path(&entry.namespace, &entry.name)?;
        let _guard = self.write_lock.lock().await;

        entry.resource_version = 1;
        let tmp = Self::write_temp(&path, &entry).await?;
        // A hard link fails if the name is taken, even by another process.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(path = %path.display(), "ledger entry created");
                Ok(entry)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(conflict(&entry, "already exists")),
            Err(e) => Err(CsiError::internal(format!("create {}: {e}", path.display()))),
        }
    }

    async fn update(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, CsiError> {
        let path = self.path(&entry.namespace, &entry.name)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read(&path).await?.ok_or_else(|| missing(&entry))?;
        if current.resource_version != entry.resource_version {
            return Err(conflict(&entry, "the object has been modified"));
        }
        entry.resource_version += 1;

        let tmp = Self::write_temp(&path, &entry).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CsiError::internal(format!("replace {}: {e}", path.display())));
        }
        debug!(path = %path.display(), version = entry.resource_version, "ledger entry updated");
        Ok(entry)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), CsiError> {
        let path = self.path(namespace, name)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::internal(format!("remove {}: {e}", path.display()))),
        }
    }
}
