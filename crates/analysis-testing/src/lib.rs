//! In-memory [`JobStore`], [`EventLog`], [`ArtifactCache`], and
//! [`RefreshLock`] implementations for exercising `analysis-core` without a
//! database. Mirrors the `InMemoryStore`-over-`Mutex<HashMap<..>>` idiom
//! used for test fixtures in the sibling job-queue crate this workspace is
//! descended from.

use std::collections::HashMap;
use std::sync::Arc;

use analysis_core::cache::{ArtifactCache, CacheError, CacheHit};
use analysis_core::card::{Card, CardOutput, CardStatus};
use analysis_core::event::Event;
use analysis_core::event_log::{EventLog, EventLogError};
use analysis_core::job::{Job, JobStatus, RequestOptions};
use analysis_core::source::Source;
use analysis_core::store::{JobStore, StoreError};
use analysis_core::{Artifact, RefreshLock, SubjectRun};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A job plus its cards, as held by [`InMemoryJobStore`].
#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    cards: HashMap<Uuid, Card>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, StoredJob>>,
    idempotency: Mutex<HashMap<(String, String), Uuid>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        user_id: &str,
        source: Source,
        subject_key: &str,
        input: Value,
        options: RequestOptions,
        requested_cards: Vec<String>,
        idempotency_key: Option<&str>,
    ) -> Result<Job, StoreError> {
        if let Some(key) = idempotency_key {
            let idem_key = (user_id.to_string(), key.to_string());
            let mut idempotency = self.idempotency.lock().await;
            if let Some(existing_id) = idempotency.get(&idem_key) {
                let jobs = self.jobs.lock().await;
                return jobs
                    .get(existing_id)
                    .map(|stored| stored.job.clone())
                    .ok_or(StoreError::JobNotFound);
            }
            let job = Job::new(
                user_id,
                source,
                subject_key,
                input,
                options,
                requested_cards,
                Some(key.to_string()),
            );
            idempotency.insert(idem_key, job.id);
            self.jobs.lock().await.insert(
                job.id,
                StoredJob {
                    job: job.clone(),
                    cards: HashMap::new(),
                },
            );
            return Ok(job);
        }

        let job = Job::new(user_id, source, subject_key, input, options, requested_cards, None);
        self.jobs.lock().await.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                cards: HashMap::new(),
            },
        );
        Ok(job)
    }

    /// Scans for the oldest `queued` job and flips it to `running`. Linear
    /// scan is fine for an in-memory test double; `PgJobStore` uses `FOR
    /// UPDATE SKIP LOCKED` for the same operation.
    async fn claim_next_queued(&self) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values_mut()
            .filter(|stored| stored.job.status == JobStatus::Queued)
            .min_by_key(|stored| stored.job.created_at);
        match next {
            Some(stored) => {
                stored.job.status = JobStatus::Running;
                Ok(Some(stored.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<Job, StoreError> {
        let jobs = self.jobs.lock().await;
        let stored = jobs.get(&job_id).ok_or(StoreError::JobNotFound)?;
        if !stored.job.is_owned_by(user_id) {
            return Err(StoreError::JobNotFound);
        }
        Ok(stored.job.clone())
    }

    async fn list_cards(&self, job_id: Uuid) -> Result<Vec<Card>, StoreError> {
        let jobs = self.jobs.lock().await;
        let stored = jobs.get(&job_id).ok_or(StoreError::JobNotFound)?;
        Ok(stored.cards.values().cloned().collect())
    }

    async fn get_card(&self, job_id: Uuid, card_id: Uuid) -> Result<Card, StoreError> {
        let jobs = self.jobs.lock().await;
        let stored = jobs.get(&job_id).ok_or(StoreError::JobNotFound)?;
        stored.cards.get(&card_id).cloned().ok_or(StoreError::CardNotFound)
    }

    async fn insert_cards(&self, cards: Vec<Card>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        for card in cards {
            let stored = jobs.get_mut(&card.job_id).ok_or(StoreError::JobNotFound)?;
            stored.cards.insert(card.id, card);
        }
        Ok(())
    }

    async fn claim_card(&self, card_id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        for stored in jobs.values_mut() {
            if let Some(card) = stored.cards.get_mut(&card_id) {
                if card.status == CardStatus::Ready {
                    card.status = CardStatus::Running;
                    return Ok(true);
                }
                return Ok(false);
            }
        }
        Err(StoreError::CardNotFound)
    }

    async fn update_card_status(&self, card_id: Uuid, status: CardStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        for stored in jobs.values_mut() {
            if let Some(card) = stored.cards.get_mut(&card_id) {
                card.status = status;
                return Ok(());
            }
        }
        Err(StoreError::CardNotFound)
    }

    async fn finish_card(
        &self,
        card_id: Uuid,
        status: CardStatus,
        output: Option<CardOutput>,
        retry_count: u32,
        _last_seq: i64,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        for stored in jobs.values_mut() {
            if let Some(card) = stored.cards.get_mut(&card_id) {
                card.status = status;
                card.output = output;
                card.retry_count = retry_count;
                return Ok(());
            }
        }
        Err(StoreError::CardNotFound)
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound)?;
        stored.job.status = status;
        if result.is_some() {
            stored.job.result = result;
        }
        stored.job.updated_at = Utc::now();
        Ok(())
    }

    async fn bump_last_seq(&self, job_id: Uuid, last_seq: i64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound)?;
        stored.job.last_seq = stored.job.last_seq.max(last_seq);
        Ok(())
    }
}

/// In-memory event log. Assigns `seq` under a per-job lock, matching the
/// "transactional `max(seq)+1`" pattern described in spec §4.1.
#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<HashMap<Uuid, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, mut event: Event) -> Result<Event, EventLogError> {
        let mut events = self.events.lock().await;
        let job_events = events.entry(event.job_id).or_default();
        let next_seq = job_events.last().map(|e| e.seq + 1).unwrap_or(1);
        event.seq = next_seq;
        job_events.push(event.clone());
        Ok(event)
    }

    async fn tail_from(
        &self,
        job_id: Uuid,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, EventLogError> {
        let events = self.events.lock().await;
        let job_events = events.get(&job_id).cloned().unwrap_or_default();
        Ok(job_events
            .into_iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .collect())
    }

    async fn last_seq(&self, job_id: Uuid) -> Result<i64, EventLogError> {
        let events = self.events.lock().await;
        Ok(events
            .get(&job_id)
            .and_then(|v| v.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }
}

/// In-memory artifact cache, keyed by the string formula in
/// `analysis_core::artifact::cache_key`.
#[derive(Default)]
pub struct InMemoryArtifactCache {
    entries: Mutex<HashMap<String, Artifact>>,
    subject_runs: Mutex<HashMap<(String, String, u32, String), SubjectRun>>,
}

impl InMemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactCache for InMemoryArtifactCache {
    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|artifact| {
            let now = Utc::now();
            let fresh = artifact.expires_at.map(|exp| now <= exp).unwrap_or(true);
            fresh.then(|| CacheHit {
                artifact: artifact.clone(),
                age: now - artifact.created_at,
            })
        }))
    }

    async fn get_stale(
        &self,
        key: &str,
        max_stale: chrono::Duration,
    ) -> Result<Option<CacheHit>, CacheError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|artifact| {
            let now = Utc::now();
            match artifact.expires_at {
                Some(exp) if now > exp && now <= exp + max_stale => Some(CacheHit {
                    artifact: artifact.clone(),
                    age: now - artifact.created_at,
                }),
                _ => None,
            }
        }))
    }

    async fn put(&self, artifact: Artifact) -> Result<(), CacheError> {
        self.entries.lock().await.insert(artifact.key.clone(), artifact);
        Ok(())
    }

    async fn extend(&self, key: &str, new_expiry: chrono::DateTime<Utc>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        if let Some(artifact) = entries.get_mut(key) {
            artifact.expires_at = Some(new_expiry);
        }
        Ok(())
    }

    async fn put_subject_run(&self, run: SubjectRun) -> Result<(), CacheError> {
        let key = (
            run.source.tag().to_string(),
            run.subject_key.clone(),
            run.pipeline_version,
            run.options_hash.clone(),
        );
        self.subject_runs.lock().await.insert(key, run);
        Ok(())
    }

    async fn get_subject_run(
        &self,
        source: &Source,
        subject_key: &str,
        pipeline_version: u32,
        options_hash: &str,
    ) -> Result<Option<SubjectRun>, CacheError> {
        let key = (
            source.tag().to_string(),
            subject_key.to_string(),
            pipeline_version,
            options_hash.to_string(),
        );
        Ok(self.subject_runs.lock().await.get(&key).cloned())
    }
}

/// In-memory refresh lock with TTL-based expiry, matching §4.8's "safety
/// TTL so a crashed worker cannot deadlock the subject forever".
#[derive(Default)]
pub struct InMemoryRefreshLock {
    held: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
}

impl InMemoryRefreshLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshLock for InMemoryRefreshLock {
    async fn acquire(&self, key: &str, ttl: chrono::Duration) -> Result<bool, CacheError> {
        let mut held = self.held.lock().await;
        let now = Utc::now();
        if let Some(expires_at) = held.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), CacheError> {
        self.held.lock().await.remove(key);
        Ok(())
    }
}

/// Convenience bundle of in-memory backends, for constructing a
/// fully-wired engine in a test in one line.
pub struct InMemoryBackends {
    pub store: Arc<InMemoryJobStore>,
    pub log: Arc<InMemoryEventLog>,
    pub cache: Arc<InMemoryArtifactCache>,
    pub refresh_lock: Arc<InMemoryRefreshLock>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        InMemoryBackends {
            store: Arc::new(InMemoryJobStore::new()),
            log: Arc::new(InMemoryEventLog::new()),
            cache: Arc::new(InMemoryArtifactCache::new()),
            refresh_lock: Arc::new(InMemoryRefreshLock::new()),
        }
    }
}

impl Default for InMemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::event::EventType;

    #[tokio::test]
    async fn event_log_assigns_gapless_sequence() {
        let log = InMemoryEventLog::new();
        let job_id = Uuid::new_v4();
        let e1 = log
            .append(Event::unsequenced(job_id, EventType::JobCreated, None, Value::Null))
            .await
            .unwrap();
        let e2 = log
            .append(Event::unsequenced(job_id, EventType::JobStarted, None, Value::Null))
            .await
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(log.last_seq(job_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tail_from_returns_only_newer_events() {
        let log = InMemoryEventLog::new();
        let job_id = Uuid::new_v4();
        for _ in 0..5 {
            log.append(Event::unsequenced(job_id, EventType::CardProgress, None, Value::Null))
                .await
                .unwrap();
        }
        let tail = log.tail_from(job_id, 2, 10).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail.iter().all(|e| e.seq > 2));
    }

    #[tokio::test]
    async fn idempotent_create_job_returns_same_job() {
        let store = InMemoryJobStore::new();
        let j1 = store
            .create_job(
                "user-1",
                Source::Scholar,
                "id:ABCDEF",
                Value::Null,
                RequestOptions::default(),
                Vec::new(),
                Some("key-1"),
            )
            .await
            .unwrap();
        let j2 = store
            .create_job(
                "user-1",
                Source::Scholar,
                "id:ABCDEF",
                Value::Null,
                RequestOptions::default(),
                Vec::new(),
                Some("key-1"),
            )
            .await
            .unwrap();
        assert_eq!(j1.id, j2.id);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_not_found() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(
                "user-1",
                Source::Github,
                "login:octocat",
                Value::Null,
                RequestOptions::default(),
                Vec::new(),
                None,
            )
            .await
            .unwrap();
        let result = store.get_job("user-2", job.id).await;
        assert!(matches!(result, Err(StoreError::JobNotFound)));
    }

    #[tokio::test]
    async fn refresh_lock_blocks_concurrent_holders_until_ttl() {
        let lock = InMemoryRefreshLock::new();
        assert!(lock.acquire("k1", chrono::Duration::seconds(60)).await.unwrap());
        assert!(!lock.acquire("k1", chrono::Duration::seconds(60)).await.unwrap());
        lock.release("k1").await.unwrap();
        assert!(lock.acquire("k1", chrono::Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn cache_stale_window_respects_bound() {
        let cache = InMemoryArtifactCache::new();
        let mut artifact = Artifact::new("k1", "full_report", serde_json::json!({"a": 1}));
        artifact.expires_at = Some(Utc::now() - chrono::Duration::hours(2));
        cache.put(artifact).await.unwrap();

        assert!(cache.get("k1").await.unwrap().is_none());
        assert!(cache
            .get_stale("k1", chrono::Duration::hours(1))
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get_stale("k1", chrono::Duration::hours(3))
            .await
            .unwrap()
            .is_some());
    }
}
