//! Local rotating NDJSON files: one `audit-YYYY-MM-DD.jsonl` per partition.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{AuditStore, RawEntry, StoreError};
use crate::event::AuditEvent;

const FILE_PREFIX: &str = "audit-";
const FILE_SUFFIX: &str = ".jsonl";

/// Newline-delimited JSON files in a single directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    dir: PathBuf,
}

impl LocalFileStore {
    /// Open (creating if needed) the audit directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    /// Use an existing directory without creating it (read-only tooling).
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `partition`.
    pub fn partition_path(&self, partition: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{partition}{FILE_SUFFIX}"))
    }
}

#[async_trait]
impl AuditStore for LocalFileStore {
    fn describe(&self) -> String {
        format!("local:{}", self.dir.display())
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    async fn append(&self, partition: &str, event: &AuditEvent) -> Result<(), StoreError> {
        let path = self.partition_path(partition);
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        file.write_all(&line)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        let location = self.dir.display().to_string();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(location, e)),
        };

        let mut partitions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(location.clone(), e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(p) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                partitions.push(p.to_string());
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    async fn read_partition(&self, partition: &str) -> Result<Vec<RawEntry>, StoreError> {
        let path = self.partition_path(partition);
        let file_name = format!("{FILE_PREFIX}{partition}{FILE_SUFFIX}");
        let contents = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
        };

        let mut lines: Vec<&[u8]> = contents.split(|b| *b == b'\n').collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }

        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| RawEntry {
                offset: i as u64,
                locator: format!("{file_name}:{}", i + 1),
                bytes: line.to_vec(),
                retention: None,
            })
            .collect())
    }
}
