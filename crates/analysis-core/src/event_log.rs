//! The [`EventLog`] trait: the durable, sequenced record every other
//! component depends on (§4.1). Shaped after the teacher's
//! `outbox.rs::OutboxWriter`/`OutboxReader` split, minus the "claim for
//! publish" step — readers here only ever tail-and-replay, never claim.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log backend error")]
    Backend(#[source] anyhow::Error),
}

/// Append-only, per-job sequenced event stream. Implementations must never
/// drop, reorder, or deduplicate events (§4.1) and must assign `seq` as a
/// gapless, strictly increasing counter per job (§8 invariant 1).
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends one event, assigning it the next `seq` for its job, and
    /// returns the event with `seq` populated.
    async fn append(&self, event: Event) -> Result<Event, EventLogError>;

    /// Returns all events with `seq > after`, ordered ascending, capped at
    /// `limit`. Used by both cold bootstrapping and SSE tail polling.
    async fn tail_from(
        &self,
        job_id: Uuid,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, EventLogError>;

    /// The current `last_seq` for a job, i.e. the `seq` of its most
    /// recently appended event, or `0` if none have been appended.
    async fn last_seq(&self, job_id: Uuid) -> Result<i64, EventLogError>;
}
