//! The [`Job`] aggregate: one analysis request and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::source::Source;

/// Job lifecycle status. Terminal states are `Completed`, `Partial`,
/// `Failed`, `Cancelled`. `Cancelling` is an internal transitional state
/// between a cancel request and the terminal `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Options recognized by the core, per spec §6. Unknown keys in a raw
/// request are preserved in `extra` so the request surface can round-trip
/// fields the core does not itself interpret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub preview: bool,
    #[serde(default)]
    pub include_internal: bool,
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RequestOptions {
    /// Stable hash input for cache-key derivation (§4.3). Only fields with
    /// observable effect on planning/execution participate; `include_internal`
    /// and `timeout_ms` are presentation-only and excluded.
    pub fn cache_relevant(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("preview".to_string(), Value::Bool(self.preview));
        Value::Object(map)
    }
}

/// One analysis request. Immutable except for `status`, `last_seq`, and
/// `result` — all other fields are fixed at creation (§3 Job invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub source: Source,
    /// Canonical normalized identifier for the subject, e.g. `id:ABCDEF`.
    pub subject_key: String,
    pub status: JobStatus,
    /// The input document as submitted, after request-surface canonicalization.
    pub input: Value,
    pub options: RequestOptions,
    /// Card types explicitly requested by the caller; empty means "all
    /// business cards for this source" (§4.6).
    pub requested_cards: Vec<String>,
    pub last_seq: i64,
    pub result: Option<Value>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        user_id: impl Into<String>,
        source: Source,
        subject_key: impl Into<String>,
        input: Value,
        options: RequestOptions,
        requested_cards: Vec<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            source,
            subject_key: subject_key.into(),
            status: JobStatus::Queued,
            input,
            options,
            requested_cards,
            last_seq: 0,
            result: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ownership check per spec §3/§8 invariant 2: reads must fail with
    /// `not_found`, not `unauthorized`, on a mismatch — the existence of
    /// another user's job is itself not disclosed.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queued_with_zero_seq() {
        let job = Job::new(
            "user-1",
            Source::Scholar,
            "id:ABCDEF",
            serde_json::json!({"content": "ABCDEF"}),
            RequestOptions::default(),
            Vec::new(),
            None,
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.last_seq, 0);
        assert!(job.result.is_none());
    }

    #[test]
    fn ownership_check_is_exact_match() {
        let job = Job::new(
            "user-1",
            Source::Github,
            "login:octocat",
            Value::Null,
            RequestOptions::default(),
            Vec::new(),
            None,
        );
        assert!(job.is_owned_by("user-1"));
        assert!(!job.is_owned_by("user-2"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
    }
}
