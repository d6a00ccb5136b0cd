//! Write-once object storage backend.
//!
//! Each event becomes one immutable object under
//! `<prefix>/<YYYY-MM-DD>/<seq:020>-<event_id>.json`. Objects may carry a
//! retention lock (mode + retain-until) which verification checks against
//! policy.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{AuditStore, RawEntry, StoreError};
use crate::event::AuditEvent;

/// Object-lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    Governance,
    Compliance,
}

impl std::str::FromStr for RetentionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "governance" => Ok(Self::Governance),
            "compliance" => Ok(Self::Compliance),
            other => Err(format!("unknown retention mode: {other}")),
        }
    }
}

/// Retention lock attached to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRetention {
    pub mode: RetentionMode,
    pub retain_until: DateTime<Utc>,
}

/// Minimal write-once object storage contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn describe(&self) -> String;

    /// Create `key`; fails with [`StoreError::AlreadyExists`] if it exists.
    async fn put_immutable(
        &self,
        key: &str,
        bytes: Vec<u8>,
        retention: Option<ObjectRetention>,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn retention(&self, key: &str) -> Result<Option<ObjectRetention>, StoreError>;
}

/// Retention lock applied to every object written by an [`ObjectAuditStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLock {
    pub mode: RetentionMode,
    pub days: u32,
}

/// [`AuditStore`] over an [`ObjectStore`].
pub struct ObjectAuditStore<O: ObjectStore> {
    objects: O,
    prefix: String,
    lock: Option<RetentionLock>,
    next_seq: Mutex<HashMap<String, u64>>,
}

impl<O: ObjectStore> ObjectAuditStore<O> {
    pub fn new(objects: O, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            lock: None,
            next_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a retention lock to every new object.
    pub fn with_retention_lock(mut self, lock: RetentionLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn objects(&self) -> &O {
        &self.objects
    }

    fn partition_prefix(&self, partition: &str) -> String {
        format!("{}/{}/", self.prefix, partition)
    }
}

#[async_trait]
impl<O: ObjectStore> AuditStore for ObjectAuditStore<O> {
    fn describe(&self) -> String {
        format!("object:{}/{}", self.objects.describe(), self.prefix)
    }

    fn supports_random_access(&self) -> bool {
        false
    }

    async fn append(&self, partition: &str, event: &AuditEvent) -> Result<(), StoreError> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = match next_seq.get(partition) {
            Some(seq) => *seq,
            None => self
                .objects
                .list(&self.partition_prefix(partition))
                .await?
                .len() as u64,
        };

        let key = format!(
            "{}{:020}-{}.json",
            self.partition_prefix(partition),
            seq,
            event.event_id
        );
        let retention = self.lock.map(|lock| ObjectRetention {
            mode: lock.mode,
            retain_until: event.timestamp + Duration::days(i64::from(lock.days)),
        });
        self.objects
            .put_immutable(&key, serde_json::to_vec(event)?, retention)
            .await?;

        next_seq.insert(partition.to_string(), seq + 1);
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        let root = format!("{}/", self.prefix);
        let mut partitions: Vec<String> = self
            .objects
            .list(&root)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&root))
            .filter_map(|rest| rest.split_once('/').map(|(p, _)| p.to_string()))
            .collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    async fn read_partition(&self, partition: &str) -> Result<Vec<RawEntry>, StoreError> {
        let keys = self.objects.list(&self.partition_prefix(partition)).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            let bytes = self.objects.get(&key).await?;
            let retention = self.objects.retention(&key).await?;
            entries.push(RawEntry {
                offset: i as u64,
                locator: key,
                bytes,
                retention,
            });
        }
        Ok(entries)
    }
}

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, Option<ObjectRetention>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::io("memory-object", std::io::Error::other("object store lock poisoned"))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn put_immutable(
        &self,
        key: &str,
        bytes: Vec<u8>,
        retention: Option<ObjectRetention>,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        if objects.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), (bytes, retention));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn retention(&self, key: &str) -> Result<Option<ObjectRetention>, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// Filesystem-backed object store.
///
/// Objects are files created with `create_new`; retention metadata lives in a
/// sidecar tree under `.retention/`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

const RETENTION_DIR: &str = ".retention";

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an object.
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn retention_path(&self, key: &str) -> PathBuf {
        self.root.join(RETENTION_DIR).join(key)
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if dir == root && entry.file_name() == RETENTION_DIR {
                continue;
            }
            walk(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(key.join("/"));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    async fn put_immutable(
        &self,
        key: &str,
        bytes: Vec<u8>,
        retention: Option<ObjectRetention>,
    ) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let path = self.object_path(key);
        let location = path.display().to_string();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(&location, e))?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            Err(e) => return Err(StoreError::io(&location, e)),
        };
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(&location, e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::io(&location, e))?;

        if let Some(retention) = retention {
            let sidecar = self.retention_path(key);
            if let Some(parent) = sidecar.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::io(sidecar.display().to_string(), e))?;
            }
            tokio::fs::write(&sidecar, serde_json::to_vec(&retention)?)
                .await
                .map_err(|e| StoreError::io(sidecar.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &root, &mut out).map(|_| out)
        })
        .await
        .map_err(|e| StoreError::io(self.describe(), std::io::Error::other(e)))?
        .map_err(|e| StoreError::io(self.describe(), e))?;

        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn retention(&self, key: &str) -> Result<Option<ObjectRetention>, StoreError> {
        let sidecar = self.retention_path(key);
        match tokio::fs::read(&sidecar).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(sidecar.display().to_string(), e)),
        }
    }
}
