//! [`PgArtifactCache`] and [`PgRefreshLock`]: Postgres-backed cross-job
//! artifact cache and subject refresh lock (§4.3, §4.8).

use analysis_core::cache::{ArtifactCache, CacheError, CacheHit};
use analysis_core::source::Source;
use analysis_core::{Artifact, RefreshLock, SubjectRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

pub struct PgArtifactCache {
    pool: PgPool,
}

impl PgArtifactCache {
    pub fn new(pool: PgPool) -> Self {
        PgArtifactCache { pool }
    }
}

fn backend(err: sqlx::Error) -> CacheError {
    CacheError::Backend(err.into())
}

fn row_to_artifact(row: &sqlx::postgres::PgRow) -> Result<Artifact, CacheError> {
    Ok(Artifact {
        key: row.try_get("key").map_err(backend)?,
        kind: row.try_get("kind").map_err(backend)?,
        content_hash: row.try_get("content_hash").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
    })
}

#[async_trait]
impl ArtifactCache for PgArtifactCache {
    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let row = sqlx::query(
            "SELECT * FROM artifact_cache WHERE key = $1 AND (expires_at IS NULL OR expires_at >= now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => {
                let artifact = row_to_artifact(&row)?;
                let age = Utc::now() - artifact.created_at;
                Ok(Some(CacheHit { artifact, age }))
            }
            None => Ok(None),
        }
    }

    async fn get_stale(
        &self,
        key: &str,
        max_stale: chrono::Duration,
    ) -> Result<Option<CacheHit>, CacheError> {
        let row = sqlx::query(
            "SELECT * FROM artifact_cache
             WHERE key = $1 AND expires_at IS NOT NULL
               AND expires_at < now() AND expires_at >= now() - $2 * INTERVAL '1 second'",
        )
        .bind(key)
        .bind(max_stale.num_seconds() as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => {
                let artifact = row_to_artifact(&row)?;
                let age = Utc::now() - artifact.created_at;
                Ok(Some(CacheHit { artifact, age }))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, artifact: Artifact) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO artifact_cache (key, kind, content_hash, payload, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (key) DO UPDATE SET
                kind = EXCLUDED.kind,
                content_hash = EXCLUDED.content_hash,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(&artifact.key)
        .bind(&artifact.kind)
        .bind(&artifact.content_hash)
        .bind(&artifact.payload)
        .bind(artifact.created_at)
        .bind(artifact.expires_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn extend(&self, key: &str, new_expiry: DateTime<Utc>) -> Result<(), CacheError> {
        sqlx::query("UPDATE artifact_cache SET expires_at = $1 WHERE key = $2")
            .bind(new_expiry)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn put_subject_run(&self, run: SubjectRun) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO subject_runs
                (source, subject_key, pipeline_version, options_hash, artifact_key, fingerprint, freshness_until)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (source, subject_key, pipeline_version, options_hash) DO UPDATE SET
                artifact_key = EXCLUDED.artifact_key,
                fingerprint = EXCLUDED.fingerprint,
                freshness_until = EXCLUDED.freshness_until",
        )
        .bind(run.source.tag())
        .bind(&run.subject_key)
        .bind(run.pipeline_version as i32)
        .bind(&run.options_hash)
        .bind(&run.artifact_key)
        .bind(&run.fingerprint)
        .bind(run.freshness_until)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_subject_run(
        &self,
        source: &Source,
        subject_key: &str,
        pipeline_version: u32,
        options_hash: &str,
    ) -> Result<Option<SubjectRun>, CacheError> {
        let row = sqlx::query(
            "SELECT * FROM subject_runs
             WHERE source = $1 AND subject_key = $2 AND pipeline_version = $3 AND options_hash = $4",
        )
        .bind(source.tag())
        .bind(subject_key)
        .bind(pipeline_version as i32)
        .bind(options_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => {
                let source_tag: String = row.try_get("source").map_err(backend)?;
                Ok(Some(SubjectRun {
                    source: Source::from(source_tag),
                    subject_key: row.try_get("subject_key").map_err(backend)?,
                    pipeline_version: row.try_get::<i32, _>("pipeline_version").map_err(backend)? as u32,
                    options_hash: row.try_get("options_hash").map_err(backend)?,
                    artifact_key: row.try_get("artifact_key").map_err(backend)?,
                    fingerprint: row.try_get("fingerprint").map_err(backend)?,
                    freshness_until: row.try_get("freshness_until").map_err(backend)?,
                }))
            }
            None => Ok(None),
        }
    }
}

pub struct PgRefreshLock {
    pool: PgPool,
}

impl PgRefreshLock {
    pub fn new(pool: PgPool) -> Self {
        PgRefreshLock { pool }
    }
}

#[async_trait]
impl RefreshLock for PgRefreshLock {
    async fn acquire(&self, key: &str, ttl: chrono::Duration) -> Result<bool, CacheError> {
        let expires_at = Utc::now() + ttl;
        let result = sqlx::query(
            "INSERT INTO refresh_locks (key, expires_at) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
             WHERE refresh_locks.expires_at < now()",
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM refresh_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
