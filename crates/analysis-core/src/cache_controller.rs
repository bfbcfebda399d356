//! The [`CacheController`]: on job start, lookup/prefill/force-refresh
//! policy; on completion, write-through + SWR refresh enqueue (§4.8).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::artifact::{cache_key, content_hash, options_hash, Artifact, SubjectRun};
use crate::cache::{ArtifactCache, RefreshLock};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::event::{Event, EventType};
use crate::event_log::EventLog;
use crate::job::{Job, RequestOptions};
use crate::refresh_pool::{RefreshRequest, RefreshSink};
use crate::source::Source;

const PIPELINE_VERSION: u32 = 1;
const FULL_REPORT_KIND: &str = "full_report";

/// Decision the controller reaches before planning. Distinguished from a
/// plain bool so callers can log/test which branch of §4.8 was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve the cached report as-is; no scheduler work needed.
    HitFresh,
    /// Prefill with the stale payload, then run cold; on completion the
    /// new result supersedes the prefill.
    HitStale,
    /// Plan and run normally; no usable cache entry exists, or the caller
    /// requested `force_refresh`.
    Miss,
}

pub struct CacheController {
    cache: Arc<dyn ArtifactCache>,
    refresh_lock: Arc<dyn RefreshLock>,
    log: Arc<dyn EventLog>,
    refresh_sink: Option<Arc<dyn RefreshSink>>,
    config: Arc<AnalysisConfig>,
}

impl CacheController {
    pub fn new(
        cache: Arc<dyn ArtifactCache>,
        refresh_lock: Arc<dyn RefreshLock>,
        log: Arc<dyn EventLog>,
        config: Arc<AnalysisConfig>,
    ) -> Self {
        CacheController {
            cache,
            refresh_lock,
            log,
            refresh_sink: None,
            config,
        }
    }

    pub fn with_refresh_sink(mut self, sink: Arc<dyn RefreshSink>) -> Self {
        self.refresh_sink = Some(sink);
        self
    }

    pub fn full_report_key(&self, source: &Source, subject_key: &str, options: &RequestOptions) -> String {
        let options_hash = options_hash(&options.cache_relevant());
        cache_key(source, subject_key, PIPELINE_VERSION, &options_hash, FULL_REPORT_KIND)
    }

    /// Looks up the cache and, if a usable entry exists, emits the prefill
    /// events directly (§4.8). Returns the policy taken so the caller knows
    /// whether to proceed to planning/scheduling.
    pub async fn before_run(&self, job: &Job) -> Result<CachePolicy, AnalysisError> {
        let key = self.full_report_key(&job.source, &job.subject_key, &job.options);

        if job.options.force_refresh {
            return Ok(CachePolicy::Miss);
        }

        if let Some(hit) = self
            .cache
            .get(&key)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?
        {
            self.emit_prefill(job, &hit.artifact).await?;
            return Ok(CachePolicy::HitFresh);
        }

        if let Some(hit) = self
            .cache
            .get_stale(&key, self.config.max_stale)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?
        {
            self.emit_prefill(job, &hit.artifact).await?;
            self.enqueue_refresh(job);
            return Ok(CachePolicy::HitStale);
        }

        Ok(CachePolicy::Miss)
    }

    async fn emit_prefill(&self, job: &Job, artifact: &Artifact) -> Result<(), AnalysisError> {
        self.log
            .append(Event::unsequenced(
                job.id,
                EventType::CardPrefill,
                None,
                artifact.payload.clone(),
            ))
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        info!(job_id = %job.id, key = %artifact.key, "served cache prefill");
        Ok(())
    }

    fn enqueue_refresh(&self, job: &Job) {
        if let Some(sink) = &self.refresh_sink {
            sink.enqueue(RefreshRequest {
                source: job.source.clone(),
                subject_key: job.subject_key.clone(),
                options: job.options.clone(),
            });
        }
    }

    /// Writes a completed job's result through to the cache and records the
    /// [`SubjectRun`] (§3) that a later fingerprint re-check reads back.
    pub async fn after_run(
        &self,
        job: &Job,
        report: Value,
        fingerprint: impl Into<String>,
    ) -> Result<(), AnalysisError> {
        let key = self.full_report_key(&job.source, &job.subject_key, &job.options);
        let ttl = chrono::Duration::from_std(self.config.ttl_for(&job.source))
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let freshness_until = Utc::now() + ttl;

        let artifact = Artifact::new(key.clone(), FULL_REPORT_KIND, report).with_ttl(ttl);
        self.cache
            .put(artifact)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        let options_hash = options_hash(&job.options.cache_relevant());
        self.cache
            .put_subject_run(SubjectRun {
                source: job.source.clone(),
                subject_key: job.subject_key.clone(),
                pipeline_version: PIPELINE_VERSION,
                options_hash,
                artifact_key: key,
                fingerprint: fingerprint.into(),
                freshness_until,
            })
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        Ok(())
    }

    /// §4.8 fingerprint re-check path: if unchanged, extends the entry's
    /// `expires_at` in place rather than running the full pipeline.
    pub async fn recheck_fingerprint(
        &self,
        run: &SubjectRun,
        fresh_fingerprint: &str,
    ) -> Result<bool, AnalysisError> {
        if run.fingerprint == fresh_fingerprint {
            let new_expiry = Utc::now()
                + chrono::Duration::from_std(self.config.ttl_for(&run.source))
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            self.cache
                .extend(&run.artifact_key, new_expiry)
                .await
                .map_err(|e| AnalysisError::Internal(e.into()))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Looks up the stored [`SubjectRun`] for `(source, subject_key,
    /// options)` and re-checks it against a freshly computed fingerprint.
    /// Used by the background refresh pool, which has no `SubjectRun` in
    /// hand yet when it decides whether a full re-run is warranted.
    pub async fn recheck_fingerprint_for(
        &self,
        source: &Source,
        subject_key: &str,
        options: &RequestOptions,
        fresh_fingerprint: &str,
    ) -> Result<bool, AnalysisError> {
        let options_hash = options_hash(&options.cache_relevant());
        let run = self
            .cache
            .get_subject_run(source, subject_key, PIPELINE_VERSION, &options_hash)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        match run {
            Some(run) => self.recheck_fingerprint(&run, fresh_fingerprint).await,
            None => Ok(false),
        }
    }

    /// Acquires the per-subject refresh lock before a background re-run,
    /// emitting `refresh.started`/`refresh.ended` around the held section.
    /// Returns `None` if another worker already holds the lock.
    pub async fn with_refresh_lock<F, Fut, T>(
        &self,
        job_id: Uuid,
        key: &str,
        work: F,
    ) -> Result<Option<T>, AnalysisError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, AnalysisError>>,
    {
        let acquired = self
            .refresh_lock
            .acquire(key, chrono::Duration::from_std(self.config.refresh_lock_ttl).unwrap())
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        if !acquired {
            return Ok(None);
        }

        self.log
            .append(Event::unsequenced(
                job_id,
                EventType::RefreshStarted,
                None,
                Value::Null,
            ))
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        let result = work().await;

        self.log
            .append(Event::unsequenced(
                job_id,
                EventType::RefreshEnded,
                None,
                Value::Null,
            ))
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        self.refresh_lock
            .release(key)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        result.map(Some)
    }
}

pub fn content_hash_of(payload: &Value) -> String {
    content_hash(payload)
}
