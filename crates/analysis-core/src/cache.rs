//! The [`ArtifactCache`] and [`RefreshLock`] traits (§4.3, §4.8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::artifact::{Artifact, SubjectRun};
use crate::source::Source;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error")]
    Backend(#[source] anyhow::Error),
}

/// A cache hit, with its age relative to the read time — used by the
/// [`crate::cache_controller::CacheController`] to decide fresh vs stale
/// vs expired.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub artifact: Artifact,
    pub age: chrono::Duration,
}

/// Cross-job keyed store of completed subject reports and resource
/// fragments, content-addressed per [`crate::artifact::cache_key`].
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError>;

    /// Returns an entry even if expired, as long as it expired less than
    /// `max_stale` ago — used for SWR prefill (§4.8).
    async fn get_stale(
        &self,
        key: &str,
        max_stale: chrono::Duration,
    ) -> Result<Option<CacheHit>, CacheError>;

    async fn put(&self, artifact: Artifact) -> Result<(), CacheError>;

    /// Pushes `expires_at` forward without rewriting the payload, used when
    /// a fingerprint re-check shows no change (§4.3, §4.8).
    async fn extend(&self, key: &str, new_expiry: DateTime<Utc>) -> Result<(), CacheError>;

    /// Upserts the [`SubjectRun`] record for a completed cold run, keyed by
    /// `(source, subject_key, pipeline_version, options_hash)` (§3).
    async fn put_subject_run(&self, run: SubjectRun) -> Result<(), CacheError>;

    /// Looks up the most recent [`SubjectRun`] for a subject tuple, used by
    /// the fingerprint re-check path (§4.8).
    async fn get_subject_run(
        &self,
        source: &Source,
        subject_key: &str,
        pipeline_version: u32,
        options_hash: &str,
    ) -> Result<Option<SubjectRun>, CacheError>;
}

/// Guards a single subject (by artifact key) from concurrent re-runs.
/// Acquisition is advisory and TTL-bounded so a crashed holder cannot
/// deadlock the subject forever (§4.8).
#[async_trait]
pub trait RefreshLock: Send + Sync {
    /// Attempts to acquire the lock for `key`, returning `false` if another
    /// holder already owns it. `ttl` bounds how long the lock survives
    /// without an explicit release.
    async fn acquire(&self, key: &str, ttl: chrono::Duration) -> Result<bool, CacheError>;

    async fn release(&self, key: &str) -> Result<(), CacheError>;
}
