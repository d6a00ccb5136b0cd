//! Result artifact storage.
//!
//! A successful job's output is written once as a JSON document; the job
//! record only carries a [`ResultRef`] (key, size, digest).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use simbridge_core::{BridgeError, JobId};

use crate::jobs::types::ResultRef;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("artifact store lock poisoned")]
    Poisoned,
}

impl From<ArtifactError> for BridgeError {
    fn from(err: ArtifactError) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the result of `job_id`, replacing any previous one.
    async fn put(&self, job_id: JobId, value: &Value) -> Result<ResultRef, ArtifactError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, ArtifactError>;

    /// Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, ArtifactError>;
}

fn artifact_key(job_id: JobId) -> String {
    format!("{job_id}.json")
}

fn describe(key: String, bytes: &[u8]) -> ResultRef {
    ResultRef {
        key,
        size_bytes: bytes.len() as u64,
        sha256: hex::encode(Sha256::digest(bytes)),
    }
}

/// One JSON file per job under a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, job_id: JobId, value: &Value) -> Result<ResultRef, ArtifactError> {
        let key = artifact_key(job_id);
        let path = self.path_for(&key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let bytes = serde_json::to_vec(value)?;
        let io = |source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io)?;
        file.write_all(&bytes).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;

        Ok(describe(key, &bytes))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ArtifactError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// In-memory artifact store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, job_id: JobId, value: &Value) -> Result<ResultRef, ArtifactError> {
        let key = artifact_key(job_id);
        let bytes = serde_json::to_vec(value)?;
        let result = describe(key.clone(), &bytes);
        self.artifacts
            .write()
            .map_err(|_| ArtifactError::Poisoned)?
            .insert(key, bytes);
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ArtifactError> {
        let artifacts = self.artifacts.read().map_err(|_| ArtifactError::Poisoned)?;
        artifacts
            .get(key)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map_err(ArtifactError::from)
    }

    async fn delete(&self, key: &str) -> Result<bool, ArtifactError> {
        Ok(self
            .artifacts
            .write()
            .map_err(|_| ArtifactError::Poisoned)?
            .remove(key)
            .is_some())
    }
}
