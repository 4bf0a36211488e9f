//! Versioned JSON records with compare-and-swap writes.
//!
//! Every write names the revision it read (`None` for "must not exist").
//! A mismatch fails with [`RotorError::StateConflict`]; writers reload and
//! retry. [`update_typed`] wraps that loop for typed records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rotor_core::RotorError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::fs_util::{atomic_write, is_safe_segment};

const MAX_CAS_RETRIES: usize = 64;
const FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub value: Value,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<VersionedRecord>>;

    /// Write `value` if the stored revision equals `expected` (`None`: the
    /// key must be absent). Returns the new revision.
    async fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: Value)
    -> Result<u64>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;
}

fn conflict(key: &str, expected: Option<u64>, found: Option<u64>) -> anyhow::Error {
    RotorError::StateConflict {
        key: key.to_string(),
        expected,
        found,
    }
    .into()
}

fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RotorError>()
        .is_some_and(RotorError::is_state_conflict)
}

/// Load and deserialize a record, returning its revision alongside.
pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<(u64, T)>> {
    let Some(record) = store.load(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_value(record.value)
        .with_context(|| format!("Failed to decode state record '{key}'"))?;
    Ok(Some((record.revision, value)))
}

/// Read-modify-write with compare-and-swap, retrying on conflict.
///
/// `mutate` starts from `T::default()` when the key is absent and may run
/// more than once. Returns what the successful `mutate` call returned.
pub async fn update_typed<T, R, F>(store: &dyn StateStore, key: &str, mut mutate: F) -> Result<R>
where
    T: Default + Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> Result<R>,
{
    for attempt in 1..=MAX_CAS_RETRIES {
        let (expected, mut value) = match load_typed::<T>(store, key).await? {
            Some((revision, value)) => (Some(revision), value),
            None => (None, T::default()),
        };
        let result = mutate(&mut value)?;
        let json = serde_json::to_value(&value)
            .with_context(|| format!("Failed to encode state record '{key}'"))?;
        match store.compare_and_swap(key, expected, json).await {
            Ok(_) => return Ok(result),
            Err(err) if is_conflict(&err) => {
                debug!(key, attempt, "State write conflicted, retrying");
            }
            Err(err) => return Err(err),
        }
    }
    bail!("Gave up updating state record '{key}' after {MAX_CAS_RETRIES} conflicting writes")
}

/// Process-local store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, VersionedRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let found = records.get(key).map(|r| r.revision);
        if found != expected {
            return Err(conflict(key, expected, found));
        }
        let revision = found.map_or(1, |r| r + 1);
        records.insert(
            key.to_string(),
            VersionedRecord {
                revision,
                updated_at: Utc::now(),
                value,
            },
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One JSON file per key under `root`; `/` in a key maps to a directory.
///
/// Writes go through a temp file and rename while holding an exclusive
/// `flock` on `{root}/locks/state.lock`, so several processes can share one
/// state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        rotor_lock::lock_path_for(&self.root, "state")
    }

    fn record_path(root: &Path, key: &str) -> Result<PathBuf> {
        let mut path = root.to_path_buf();
        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments {
            if !is_safe_segment(segment) {
                bail!("Invalid state key '{key}'");
            }
        }
        for segment in &segments[..segments.len() - 1] {
            path.push(segment);
        }
        path.push(format!("{}.{RECORD_EXTENSION}", segments[segments.len() - 1]));
        Ok(path)
    }

    fn read_record(path: &Path) -> Result<Option<VersionedRecord>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let record = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt state record {}", path.display()))?;
                Ok(Some(record))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read state record {}", path.display()))
            }
        }
    }

    fn cas_blocking(
        root: &Path,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64> {
        let path = Self::record_path(root, key)?;
        let _lock = rotor_lock::acquire_with_timeout(
            &rotor_lock::lock_path_for(root, "state"),
            "file-state-store",
            key,
            FILE_LOCK_TIMEOUT,
        )?;
        let found = Self::read_record(&path)?.map(|r| r.revision);
        if found != expected {
            return Err(conflict(key, expected, found));
        }
        let revision = found.map_or(1, |r| r + 1);
        let record = VersionedRecord {
            revision,
            updated_at: Utc::now(),
            value,
        };
        let json = serde_json::to_vec_pretty(&record).context("Failed to encode state record")?;
        atomic_write(&path, &json)?;
        Ok(revision)
    }

    fn delete_blocking(root: &Path, key: &str) -> Result<bool> {
        let path = Self::record_path(root, key)?;
        let _lock = rotor_lock::acquire_with_timeout(
            &rotor_lock::lock_path_for(root, "state"),
            "file-state-store",
            key,
            FILE_LOCK_TIMEOUT,
        )?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete state record {}", path.display()))
            }
        }
    }

    fn collect_keys(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to list state dir {}", dir.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                if prefix.is_empty() && name == "locks" {
                    continue;
                }
                Self::collect_keys(&path, &format!("{prefix}{name}/"), out)?;
            } else if let Some(stem) = name.strip_suffix(&format!(".{RECORD_EXTENSION}")) {
                out.push(format!("{prefix}{stem}"));
            }
        }
        Ok(())
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("State store task panicked")?
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> Result<Option<VersionedRecord>> {
        let path = Self::record_path(&self.root, key)?;
        run_blocking(move || Self::read_record(&path)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64> {
        let root = self.root.clone();
        let key = key.to_string();
        run_blocking(move || Self::cas_blocking(&root, &key, expected, value)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let root = self.root.clone();
        let key = key.to_string();
        run_blocking(move || Self::delete_blocking(&root, &key)).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        run_blocking(move || {
            let mut keys = Vec::new();
            Self::collect_keys(&root, "", &mut keys)?;
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
#[path = "state_store_tests.rs"]
mod tests;
