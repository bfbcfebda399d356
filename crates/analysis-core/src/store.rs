//! The [`JobStore`] trait: persistent state for jobs, cards, and
//! idempotency (§4.2). Modeled on the teacher's `job.rs::JobStore` shape —
//! a thin, policy-light async trait that a concrete store implements.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::card::{Card, CardOutput, CardStatus};
use crate::job::{Job, JobStatus, RequestOptions};
use crate::source::Source;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found")]
    JobNotFound,
    #[error("card not found")]
    CardNotFound,
    #[error("idempotency key already bound to a different request")]
    IdempotencyConflict,
    #[error("storage backend error")]
    Backend(#[source] anyhow::Error),
}

/// Persistent state for jobs and cards. Implementations must uphold §8
/// invariant 3 (at-most-once card execution): `claim_card` is a
/// compare-and-set from `ready` to `running`, returning `false` — not an
/// error — when another worker already won the race.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        user_id: &str,
        source: Source,
        subject_key: &str,
        input: Value,
        options: RequestOptions,
        requested_cards: Vec<String>,
        idempotency_key: Option<&str>,
    ) -> Result<Job, StoreError>;

    /// Atomically claims one `queued` job and flips it to `running`, for a
    /// worker loop's poll cycle. `Ok(None)` means the queue is empty.
    async fn claim_next_queued(&self) -> Result<Option<Job>, StoreError>;

    /// Fails with [`StoreError::JobNotFound`] on an ownership mismatch as
    /// well as on true absence, per §8 invariant 2 — existence of another
    /// user's job must not be disclosed.
    async fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<Job, StoreError>;

    async fn list_cards(&self, job_id: Uuid) -> Result<Vec<Card>, StoreError>;

    async fn get_card(&self, job_id: Uuid, card_id: Uuid) -> Result<Card, StoreError>;

    async fn insert_cards(&self, cards: Vec<Card>) -> Result<(), StoreError>;

    /// Atomic compare-and-set `ready -> running`. `Ok(false)` means another
    /// worker already claimed the card; this is not an error.
    async fn claim_card(&self, card_id: Uuid) -> Result<bool, StoreError>;

    async fn update_card_status(&self, card_id: Uuid, status: CardStatus) -> Result<(), StoreError>;

    /// Persists the card's terminal output and retry count, and bumps the
    /// owning job's `last_seq`. Must be called at most once per card in a
    /// terminal state (§8 invariant 3).
    async fn finish_card(
        &self,
        card_id: Uuid,
        status: CardStatus,
        output: Option<CardOutput>,
        retry_count: u32,
        last_seq: i64,
    ) -> Result<(), StoreError>;

    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<(), StoreError>;

    async fn bump_last_seq(&self, job_id: Uuid, last_seq: i64) -> Result<(), StoreError>;
}
