//! Artifact keying, [`SubjectRun`] fingerprint records, and idempotency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::source::Source;

/// A keyed blob produced by a card, either within-job (read by dependent
/// cards) or cross-job (a cache entry). See [`cache_key`] for the
/// content-addressed key formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub key: String,
    pub kind: String,
    pub content_hash: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let content_hash = content_hash(&payload);
        Artifact {
            key: key.into(),
            kind: kind.into(),
            content_hash,
            payload,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }
}

/// Deterministic content hash used as `Artifact::content_hash` and to
/// detect whether a refreshed payload actually differs (§8 invariant 7).
pub fn content_hash(payload: &Value) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// Cache key formula per §4.3: `(source, subject_key, pipeline_version,
/// options_hash, kind)`.
pub fn cache_key(
    source: &Source,
    subject_key: &str,
    pipeline_version: u32,
    options_hash: &str,
    kind: &str,
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        source.tag(),
        subject_key,
        pipeline_version,
        options_hash,
        kind
    )
}

/// Short hash over the `options` fields that affect planning/execution,
/// stable regardless of JSON key order.
pub fn options_hash(options: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(options).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let inner: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, canonicalize(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// One record per successful end-to-end analysis of a
/// `(source, subject_key, pipeline_version, options_hash)` tuple (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRun {
    pub source: Source,
    pub subject_key: String,
    pub pipeline_version: u32,
    pub options_hash: String,
    pub artifact_key: String,
    pub fingerprint: String,
    pub freshness_until: DateTime<Utc>,
}

impl SubjectRun {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now <= self.freshness_until
    }

    pub fn is_within_max_stale(&self, now: DateTime<Utc>, max_stale: chrono::Duration) -> bool {
        now <= self.freshness_until + max_stale
    }
}

/// `(user_id, idempotency_key) -> job_id` binding written on job creation
/// (§4.2). Re-used to detect conflicting retries with a differing body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: String,
    pub idempotency_key: String,
    pub job_id: uuid::Uuid,
    /// Hash of the original request body, to detect a differing retry.
    pub request_hash: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_formula_is_stable() {
        let k1 = cache_key(&Source::Scholar, "id:ABCDEF", 3, "abc123", "full_report");
        let k2 = cache_key(&Source::Scholar, "id:ABCDEF", 3, "abc123", "full_report");
        assert_eq!(k1, k2);
        assert_eq!(k1, "scholar:id:ABCDEF:3:abc123:full_report");
    }

    #[test]
    fn options_hash_ignores_key_order() {
        let a = serde_json::json!({"preview": true, "extra": {"x": 1, "y": 2}});
        let b = serde_json::json!({"extra": {"y": 2, "x": 1}, "preview": true});
        assert_eq!(options_hash(&a), options_hash(&b));
    }

    #[test]
    fn content_hash_changes_with_payload() {
        let h1 = content_hash(&serde_json::json!({"citations": 10}));
        let h2 = content_hash(&serde_json::json!({"citations": 11}));
        assert_ne!(h1, h2);
    }

    #[test]
    fn subject_run_freshness_windows() {
        let now = Utc::now();
        let run = SubjectRun {
            source: Source::Github,
            subject_key: "login:octocat".to_string(),
            pipeline_version: 1,
            options_hash: "abc".to_string(),
            artifact_key: "github:login:octocat:1:abc:full_report".to_string(),
            fingerprint: "fp1".to_string(),
            freshness_until: now - chrono::Duration::hours(1),
        };
        assert!(!run.is_fresh(now));
        assert!(run.is_within_max_stale(now, chrono::Duration::hours(2)));
        assert!(!run.is_within_max_stale(now, chrono::Duration::minutes(30)));
    }
}
