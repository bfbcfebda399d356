//! [`PgJobStore`]: Postgres-backed [`JobStore`]. Raw `sqlx::query` calls
//! throughout (never the `query!`/`query_as!` compile-time macros) —
//! matching the style of the sibling job-queue crate this workspace is
//! descended from, which runs without a live database at build time.

use analysis_core::card::{Card, CardOutput, CardStatus};
use analysis_core::job::{Job, JobStatus, RequestOptions};
use analysis_core::source::Source;
use analysis_core::store::{JobStore, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        PgJobStore { pool }
    }
}

fn card_status_str(status: CardStatus) -> &'static str {
    match status {
        CardStatus::Pending => "pending",
        CardStatus::Ready => "ready",
        CardStatus::Running => "running",
        CardStatus::Completed => "completed",
        CardStatus::Failed => "failed",
        CardStatus::Skipped => "skipped",
    }
}

fn parse_card_status(raw: &str) -> CardStatus {
    match raw {
        "ready" => CardStatus::Ready,
        "running" => CardStatus::Running,
        "completed" => CardStatus::Completed,
        "failed" => CardStatus::Failed,
        "skipped" => CardStatus::Skipped,
        _ => CardStatus::Pending,
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Cancelling => "cancelling",
        JobStatus::Completed => "completed",
        JobStatus::Partial => "partial",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(raw: &str) -> JobStatus {
    match raw {
        "running" => JobStatus::Running,
        "cancelling" => JobStatus::Cancelling,
        "completed" => JobStatus::Completed,
        "partial" => JobStatus::Partial,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Queued,
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let options_raw: Value = row.try_get("options").map_err(backend)?;
    let options: RequestOptions = serde_json::from_value(options_raw).unwrap_or_default();
    let source_raw: String = row.try_get("source").map_err(backend)?;
    Ok(Job {
        id: row.try_get("id").map_err(backend)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        source: Source::from(source_raw),
        subject_key: row.try_get("subject_key").map_err(backend)?,
        status: parse_job_status(row.try_get::<String, _>("status").map_err(backend)?.as_str()),
        input: row.try_get("input").map_err(backend)?,
        options,
        requested_cards: row.try_get("requested_cards").map_err(backend)?,
        last_seq: row.try_get("last_seq").map_err(backend)?,
        result: row.try_get("result").map_err(backend)?,
        idempotency_key: row.try_get("idempotency_key").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn row_to_card(row: &sqlx::postgres::PgRow) -> Result<Card, StoreError> {
    let deps_raw: Value = row.try_get("deps").map_err(backend)?;
    let deps = deps_raw
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let output_raw: Option<Value> = row.try_get("output").map_err(backend)?;
    let output = output_raw.and_then(|v| serde_json::from_value::<CardOutput>(v).ok());

    Ok(Card {
        id: row.try_get("id").map_err(backend)?,
        job_id: row.try_get("job_id").map_err(backend)?,
        card_type: row.try_get("card_type").map_err(backend)?,
        priority: row.try_get("priority").map_err(backend)?,
        concurrency_group: row.try_get("concurrency_group").map_err(backend)?,
        deadline_ms: row
            .try_get::<Option<i64>, _>("deadline_ms")
            .map_err(backend)?
            .map(|v| v as u64),
        deps,
        status: parse_card_status(row.try_get::<String, _>("status").map_err(backend)?.as_str()),
        retry_count: row.try_get::<i32, _>("retry_count").map_err(backend)? as u32,
        internal: row.try_get("internal").map_err(backend)?,
        output,
    })
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

#[async_trait]
impl JobStore for PgJobStore {
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
        let mut tx = self.pool.begin().await.map_err(backend)?;

        if let Some(key) = idempotency_key {
            let existing = sqlx::query("SELECT job_id FROM idempotency_keys WHERE user_id = $1 AND idempotency_key = $2")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            if let Some(row) = existing {
                let job_id: Uuid = row.try_get("job_id").map_err(backend)?;
                let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(backend)?;
                return row_to_job(&row);
            }
        }

        let job = Job::new(
            user_id,
            source,
            subject_key,
            input,
            options,
            requested_cards,
            idempotency_key.map(str::to_string),
        );

        sqlx::query(
            "INSERT INTO jobs (id, user_id, source, subject_key, status, input, options, requested_cards, last_seq, result, idempotency_key, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(job.source.tag())
        .bind(&job.subject_key)
        .bind(job_status_str(job.status))
        .bind(&job.input)
        .bind(serde_json::to_value(&job.options).unwrap_or(Value::Null))
        .bind(&job.requested_cards)
        .bind(job.last_seq)
        .bind(&job.result)
        .bind(&job.idempotency_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query("INSERT INTO event_seq_counters (job_id, last_seq) VALUES ($1, 0)")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        if let Some(key) = idempotency_key {
            let request_hash = analysis_core::content_hash(&job.input);
            sqlx::query(
                "INSERT INTO idempotency_keys (user_id, idempotency_key, job_id, request_hash) VALUES ($1, $2, $3, $4)",
            )
            .bind(user_id)
            .bind(key)
            .bind(job.id)
            .bind(request_hash)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(job)
    }

    /// Compare-and-set `queued -> running` for the oldest queued job,
    /// using `FOR UPDATE SKIP LOCKED` the same way `claim_card` does so
    /// multiple worker-loop instances never claim the same job twice.
    async fn claim_next_queued(&self) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'queued'
             ORDER BY created_at ASC
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let row = match row {
            Some(row) => row,
            None => {
                tx.commit().await.map_err(backend)?;
                return Ok(None);
            }
        };
        let job = row_to_job(&row)?;

        sqlx::query("UPDATE jobs SET status = 'running', updated_at = now() WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(Some(Job {
            status: JobStatus::Running,
            ..job
        }))
    }

    async fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 AND user_id = $2")
            .bind(job_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::JobNotFound)?;
        row_to_job(&row)
    }

    async fn list_cards(&self, job_id: Uuid) -> Result<Vec<Card>, StoreError> {
        let rows = sqlx::query("SELECT * FROM cards WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_card).collect()
    }

    async fn get_card(&self, job_id: Uuid, card_id: Uuid) -> Result<Card, StoreError> {
        let row = sqlx::query("SELECT * FROM cards WHERE job_id = $1 AND id = $2")
            .bind(job_id)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::CardNotFound)?;
        row_to_card(&row)
    }

    async fn insert_cards(&self, cards: Vec<Card>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for card in cards {
            let deps: Vec<String> = card.deps.into_iter().collect();
            sqlx::query(
                "INSERT INTO cards (id, job_id, card_type, priority, concurrency_group, deadline_ms, deps, status, retry_count, internal, output)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(card.id)
            .bind(card.job_id)
            .bind(&card.card_type)
            .bind(card.priority)
            .bind(&card.concurrency_group)
            .bind(card.deadline_ms.map(|v| v as i64))
            .bind(serde_json::to_value(&deps).unwrap_or(Value::Array(vec![])))
            .bind(card_status_str(card.status))
            .bind(card.retry_count as i32)
            .bind(card.internal)
            .bind(card.output.map(|o| serde_json::to_value(o).unwrap_or(Value::Null)))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    /// Compare-and-set `ready -> running`, using `FOR UPDATE SKIP LOCKED`
    /// so two workers racing the same card never both win (§8 invariant 3).
    async fn claim_card(&self, card_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query(
            "SELECT id FROM cards WHERE id = $1 AND status = 'ready' FOR UPDATE SKIP LOCKED",
        )
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        if row.is_none() {
            tx.commit().await.map_err(backend)?;
            return Ok(false);
        }

        sqlx::query("UPDATE cards SET status = 'running' WHERE id = $1")
            .bind(card_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }

    async fn update_card_status(&self, card_id: Uuid, status: CardStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE cards SET status = $1 WHERE id = $2")
            .bind(card_status_str(status))
            .bind(card_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn finish_card(
        &self,
        card_id: Uuid,
        status: CardStatus,
        output: Option<CardOutput>,
        retry_count: u32,
        last_seq: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let job_id: Uuid = sqlx::query("SELECT job_id FROM cards WHERE id = $1")
            .bind(card_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?
            .try_get("job_id")
            .map_err(backend)?;

        sqlx::query("UPDATE cards SET status = $1, output = $2, retry_count = $3 WHERE id = $4")
            .bind(card_status_str(status))
            .bind(output.map(|o| serde_json::to_value(o).unwrap_or(Value::Null)))
            .bind(retry_count as i32)
            .bind(card_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        if last_seq > 0 {
            sqlx::query("UPDATE jobs SET last_seq = GREATEST(last_seq, $1) WHERE id = $2")
                .bind(last_seq)
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = $1, result = COALESCE($2, result), updated_at = now() WHERE id = $3")
            .bind(job_status_str(status))
            .bind(result)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn bump_last_seq(&self, job_id: Uuid, last_seq: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET last_seq = GREATEST(last_seq, $1) WHERE id = $2")
            .bind(last_seq)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
