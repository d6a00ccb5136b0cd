//! SQLite-backed job registry.
//!
//! One row per job id in `jobs` (the full record as JSON plus the columns the
//! recovery and retention scans filter on) and one row per (tool, key) in
//! `idempotency`. The database is a local file in WAL mode, so the registry
//! survives restarts without any external service.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::info;

use simbridge_core::{time, JobId};

use super::registry::{ClaimOutcome, IdempotencyRecord, JobRegistry, RecordQuery, RegistryError};
use super::types::JobRecord;

/// SQLite job registry.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteJobRegistry {
    pool: SqlitePool,
}

impl SqliteJobRegistry {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RegistryError::Storage(format!(
                    "failed to create registry directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let registry = Self { pool };
        registry.migrate().await?;
        info!(path = %path.display(), "sqlite job registry opened");
        Ok(registry)
    }

    /// Private in-memory database (single connection).
    pub async fn in_memory() -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                kind          TEXT NOT NULL,
                status        TEXT NOT NULL,
                submitted_at  TEXT NOT NULL,
                finished_at   TEXT NULL,
                record        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status, finished_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency (
                tool          TEXT NOT NULL,
                key           TEXT NOT NULL,
                fingerprint   TEXT NOT NULL,
                job_id        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                PRIMARY KEY (tool, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idempotency_job_idx ON idempotency (job_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, RegistryError> {
        let raw: String = row.try_get("record")?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn decode_mapping(row: &sqlx::sqlite::SqliteRow) -> Result<IdempotencyRecord, RegistryError> {
        let job_id: String = row.try_get("job_id")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(IdempotencyRecord {
            tool: row.try_get("tool")?,
            key: row.try_get("key")?,
            fingerprint: row.try_get("fingerprint")?,
            job_id: job_id
                .parse()
                .map_err(|e| RegistryError::Storage(format!("bad job id in idempotency row: {e}")))?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| RegistryError::Storage(format!("bad timestamp in idempotency row: {e}")))?
                .with_timezone(&chrono::Utc),
        })
    }
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn upsert(&self, record: &JobRecord) -> Result<(), RegistryError> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, status, submitted_at, finished_at, record)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                status = excluded.status,
                submitted_at = excluded.submitted_at,
                finished_at = excluded.finished_at,
                record = excluded.record
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(time::format(record.submitted_at))
        .bind(record.finished_at.map(time::format))
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, RegistryError> {
        let row = sqlx::query("SELECT record FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<JobRecord>, RegistryError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT record FROM jobs WHERE 1 = 1");
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(kind) = &query.kind {
            qb.push(" AND kind = ").push_bind(kind.clone());
        }
        if let Some(cutoff) = query.finished_before {
            qb.push(" AND finished_at IS NOT NULL AND finished_at < ")
                .push_bind(time::format(cutoff));
        }
        qb.push(" ORDER BY submitted_at ASC, id ASC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode_record).collect()
    }

    async fn delete(&self, id: JobId) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn idempotency_get(
        &self,
        tool: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RegistryError> {
        let row = sqlx::query(
            "SELECT tool, key, fingerprint, job_id, created_at FROM idempotency WHERE tool = ? AND key = ?",
        )
        .bind(tool)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_mapping).transpose()
    }

    async fn idempotency_claim(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ClaimOutcome, RegistryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency (tool, key, fingerprint, job_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tool, key) DO NOTHING
            "#,
        )
        .bind(&record.tool)
        .bind(&record.key)
        .bind(&record.fingerprint)
        .bind(record.job_id.to_string())
        .bind(time::format(record.created_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }
        match self.idempotency_get(&record.tool, &record.key).await? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(RegistryError::Storage(format!(
                "idempotency mapping ({}, {}) vanished during claim",
                record.tool, record.key
            ))),
        }
    }

    async fn idempotency_delete_for_job(&self, job_id: JobId) -> Result<u64, RegistryError> {
        let result = sqlx::query("DELETE FROM idempotency WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::jobs::types::{JobStatus, ResultRef};

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let mut record = JobRecord::new(JobId::new(), "sim.a", json!({"x": 1}), 5, 1, time::now());
        {
            let reg = SqliteJobRegistry::open(&path).await.unwrap();
            reg.upsert(&record).await.unwrap();
            record.mark_running(time::now()).unwrap();
            record
                .mark_succeeded(
                    ResultRef {
                        key: "a.json".into(),
                        size_bytes: 1,
                        sha256: "ab".into(),
                    },
                    time::now(),
                )
                .unwrap();
            reg.upsert(&record).await.unwrap();
        }

        let reg = SqliteJobRegistry::open(&path).await.unwrap();
        let back = reg.get(record.id).await.unwrap().unwrap();
        assert_eq!(back, record);
        assert_eq!(back.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn list_and_delete() {
        let reg = SqliteJobRegistry::in_memory().await.unwrap();
        let a = JobRecord::new(JobId::new(), "sim.a", json!({}), 5, 0, time::now());
        let mut b = JobRecord::new(JobId::new(), "sim.b", json!({}), 5, 0, time::now());
        b.mark_running(time::now()).unwrap();
        b.mark_cancelled(time::now()).unwrap();
        reg.upsert(&a).await.unwrap();
        reg.upsert(&b).await.unwrap();

        let queued = reg.list(&RecordQuery::status(JobStatus::Queued)).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);

        let finished = reg
            .list(&RecordQuery::default().finished_before(Utc::now() + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, b.id);

        assert_eq!(reg.list(&RecordQuery::default().limit(1)).await.unwrap().len(), 1);

        assert!(reg.delete(b.id).await.unwrap());
        assert!(!reg.delete(b.id).await.unwrap());
        assert!(reg.get(b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_claim_round_trip() {
        let reg = SqliteJobRegistry::in_memory().await.unwrap();
        let mapping = IdempotencyRecord {
            tool: "run_sim".into(),
            key: "abc".into(),
            fingerprint: "fp".into(),
            job_id: JobId::new(),
            created_at: time::now(),
        };
        assert_eq!(reg.idempotency_claim(&mapping).await.unwrap(), ClaimOutcome::Claimed);

        let other = IdempotencyRecord {
            fingerprint: "other".into(),
            job_id: JobId::new(),
            ..mapping.clone()
        };
        assert_eq!(
            reg.idempotency_claim(&other).await.unwrap(),
            ClaimOutcome::Existing(mapping.clone())
        );
        assert_eq!(reg.idempotency_delete_for_job(mapping.job_id).await.unwrap(), 1);
        assert!(reg.idempotency_get("run_sim", "abc").await.unwrap().is_none());
    }
}
