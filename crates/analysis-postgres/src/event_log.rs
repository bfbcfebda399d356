//! [`PgEventLog`]: assigns `seq` via `SELECT ... FOR UPDATE` on a per-job
//! counter row in the same transaction as the insert (§4.1), giving a
//! gapless, strictly increasing sequence per job.

use analysis_core::event::{Event, EventType};
use analysis_core::event_log::{EventLog, EventLogError};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        PgEventLog { pool }
    }
}

fn backend(err: sqlx::Error) -> EventLogError {
    EventLogError::Backend(err.into())
}

fn event_type_str(event_type: EventType) -> &'static str {
    event_type.wire_name()
}

fn parse_event_type(raw: &str) -> EventType {
    match raw {
        "job.created" => EventType::JobCreated,
        "job.started" => EventType::JobStarted,
        "card.ready" => EventType::CardReady,
        "card.started" => EventType::CardStarted,
        "card.prefill" => EventType::CardPrefill,
        "card.progress" => EventType::CardProgress,
        "card.delta" => EventType::CardDelta,
        "card.append" => EventType::CardAppend,
        "card.completed" => EventType::CardCompleted,
        "card.failed" => EventType::CardFailed,
        "refresh.started" => EventType::RefreshStarted,
        "refresh.ended" => EventType::RefreshEnded,
        "job.completed" => EventType::JobCompleted,
        "job.partial" => EventType::JobPartial,
        "job.failed" => EventType::JobFailed,
        "job.cancelled" => EventType::JobCancelled,
        _ => EventType::Heartbeat,
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, EventLogError> {
    Ok(Event {
        id: row.try_get("id").map_err(backend)?,
        job_id: row.try_get("job_id").map_err(backend)?,
        seq: row.try_get("seq").map_err(backend)?,
        event_type: parse_event_type(row.try_get::<String, _>("event_type").map_err(backend)?.as_str()),
        card_id: row.try_get("card_id").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, mut event: Event) -> Result<Event, EventLogError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(
            "UPDATE event_seq_counters SET last_seq = last_seq + 1 WHERE job_id = $1 RETURNING last_seq",
        )
        .bind(event.job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let next_seq: i64 = row.try_get("last_seq").map_err(backend)?;
        event.seq = next_seq;

        sqlx::query(
            "INSERT INTO events (id, job_id, seq, event_type, card_id, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(event.job_id)
        .bind(event.seq)
        .bind(event_type_str(event.event_type))
        .bind(event.card_id)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(event)
    }

    async fn tail_from(
        &self,
        job_id: Uuid,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, EventLogError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE job_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3",
        )
        .bind(job_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn last_seq(&self, job_id: Uuid) -> Result<i64, EventLogError> {
        let row = sqlx::query("SELECT last_seq FROM event_seq_counters WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|r| r.try_get::<i64, _>("last_seq").unwrap_or(0)).unwrap_or(0))
    }
}
