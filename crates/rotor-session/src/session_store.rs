//! Browser session snapshots captured before a rotation.
//!
//! A snapshot is immutable once written: saving an id that already exists
//! is an error, and reads hand out copies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use rotor_core::SessionSnapshot;
use tracing::{debug, warn};

use crate::fs_util::{atomic_create, is_safe_segment};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// `None` when absent or older than the store's TTL.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    /// Most recently captured live snapshot.
    async fn get_latest_session(&self) -> Result<Option<SessionSnapshot>>;
}

fn is_expired(snapshot: &SessionSnapshot, ttl: Option<Duration>) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    let age = Utc::now().signed_duration_since(snapshot.captured_at);
    age.to_std().is_ok_and(|age| age > ttl)
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    ttl: Option<Duration>,
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(&snapshot.session_id) {
            bail!("Session snapshot '{}' already exists", snapshot.session_id);
        }
        sessions.insert(snapshot.session_id.clone(), snapshot.clone());
        debug!(session_id = %snapshot.session_id, "Stored session snapshot");
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(session_id) {
            Some(snapshot) if is_expired(snapshot, self.ttl) => {
                sessions.remove(session_id);
                Ok(None)
            }
            Some(snapshot) => Ok(Some(snapshot.clone())),
            None => Ok(None),
        }
    }

    async fn get_latest_session(&self) -> Result<Option<SessionSnapshot>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        sessions.retain(|_, snapshot| !is_expired(snapshot, ttl));
        Ok(sessions
            .values()
            .max_by_key(|snapshot| snapshot.captured_at)
            .cloned())
    }
}

/// One pretty-printed JSON file per snapshot: `{dir}/{session_id}.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    ttl: Option<Duration>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, session_id: &str) -> Result<PathBuf> {
        if !is_safe_segment(session_id) {
            bail!("Invalid session id '{session_id}'");
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    /// Newest unexpired snapshot in `dir`. Blocking.
    fn scan_latest(dir: &Path, ttl: Option<Duration>) -> Result<Option<SessionSnapshot>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to list {}", dir.display()));
            }
        };

        let mut latest: Option<SessionSnapshot> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot = match Self::read_snapshot(&path) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable session snapshot");
                    continue;
                }
            };
            if is_expired(&snapshot, ttl) {
                continue;
            }
            if latest
                .as_ref()
                .is_none_or(|current| snapshot.captured_at > current.captured_at)
            {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }

    fn read_snapshot(path: &Path) -> Result<Option<SessionSnapshot>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .with_context(|| format!("Corrupt session snapshot {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read session snapshot {}", path.display())),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.session_id)?;
        let json =
            serde_json::to_vec_pretty(snapshot).context("Failed to serialize session snapshot")?;
        let created = tokio::task::spawn_blocking(move || atomic_create(&path, &json))
            .await
            .context("Session write task panicked")??;
        if !created {
            bail!("Session snapshot '{}' already exists", snapshot.session_id);
        }
        debug!(session_id = %snapshot.session_id, "Stored session snapshot");
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.snapshot_path(session_id)?;
        let snapshot = tokio::task::spawn_blocking(move || Self::read_snapshot(&path))
            .await
            .context("Session read task panicked")??;
        Ok(snapshot.filter(|s| !is_expired(s, self.ttl)))
    }

    async fn get_latest_session(&self) -> Result<Option<SessionSnapshot>> {
        let dir = self.dir.clone();
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || Self::scan_latest(&dir, ttl))
            .await
            .context("Session scan task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_core::Cookie;
    use tempfile::tempdir;

    fn snapshot(url: &str, age_secs: i64) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new(url);
        snapshot.captured_at = Utc::now() - chrono::Duration::seconds(age_secs);
        snapshot.cookies.push(Cookie::new("sid", "abc"));
        snapshot
            .local_storage
            .insert("cart".to_string(), "[1,2]".to_string());
        snapshot
    }

    async fn exercise(store: &dyn SessionStore) {
        let older = snapshot("https://example.test/a", 60);
        let newer = snapshot("https://example.test/b", 5);
        store.save_session(&older).await.unwrap();
        store.save_session(&newer).await.unwrap();

        let restored = store.get_session(&older.session_id).await.unwrap().unwrap();
        assert_eq!(restored, older);
        assert_eq!(restored.cookies, older.cookies);
        assert_eq!(restored.local_storage, older.local_storage);

        let latest = store.get_latest_session().await.unwrap().unwrap();
        assert_eq!(latest.session_id, newer.session_id);

        let err = store.save_session(&older).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        assert!(store.get_session("01UNKNOWN").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        exercise(&MemorySessionStore::new(None)).await;
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        exercise(&FileSessionStore::new(dir.path().join("sessions"), None)).await;
    }

    #[tokio::test]
    async fn test_memory_ttl_expires_entries() {
        let store = MemorySessionStore::new(Some(Duration::from_secs(30)));
        let stale = snapshot("https://example.test/stale", 120);
        let fresh = snapshot("https://example.test/fresh", 1);
        store.save_session(&stale).await.unwrap();
        store.save_session(&fresh).await.unwrap();

        assert!(store.get_session(&stale.session_id).await.unwrap().is_none());
        assert_eq!(
            store.get_latest_session().await.unwrap().unwrap().session_id,
            fresh.session_id
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_file_ttl_hides_stale_snapshots() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), Some(Duration::from_secs(30)));
        let stale = snapshot("https://example.test/stale", 120);
        store.save_session(&stale).await.unwrap();

        assert!(store.get_session(&stale.session_id).await.unwrap().is_none());
        assert!(store.get_latest_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_empty_dir() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("missing"), None);
        assert!(store.get_latest_session().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_concurrent_saves_keep_first_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), None);
        let original = snapshot("https://example.test/a", 0);

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            let mut attempt = original.clone();
            attempt.url = format!("https://example.test/writer-{n}");
            tasks.spawn(async move { (attempt.url.clone(), store.save_session(&attempt).await) });
        }
        let mut winners = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (url, result) = joined.unwrap();
            match result {
                Ok(()) => winners.push(url),
                Err(err) => assert!(err.to_string().contains("already exists"), "{err:#}"),
            }
        }
        assert_eq!(winners.len(), 1, "{winners:?}");

        let stored = store
            .get_session(&original.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.url, winners[0]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path(), None);
        assert!(store.get_session("../etc/passwd").await.is_err());
    }
}
