//! The [`Card`] aggregate: one unit of work belonging to a job.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Card lifecycle status (§6 status vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl CardStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CardStatus::Completed | CardStatus::Failed | CardStatus::Skipped
        )
    }

    /// A dependency in this state unblocks dependents (§4.7 ready-set rule).
    /// `Skipped` counts as policy-permitted failure per the optional-dep note.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, CardStatus::Completed | CardStatus::Skipped)
    }
}

/// Latency bookkeeping the scheduler always populates, independent of
/// whatever the handler itself reports (§3 `CardOutput.meta.timing`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl CardTiming {
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self) {
        let end = Utc::now();
        self.ended_at = Some(end);
        if let Some(start) = self.started_at {
            self.duration_ms = Some((end - start).num_milliseconds());
        }
    }
}

/// Envelope metadata accompanying a card's `data` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardMeta {
    /// When true, pruning of empty keys is disabled for this card
    /// unconditionally (§4.7 pruning policy).
    #[serde(default)]
    pub preserve_empty: bool,
    #[serde(default)]
    pub fallback: bool,
    /// Machine-readable error/fallback tag, e.g. `upstream_unavailable`.
    pub code: Option<String>,
    #[serde(default)]
    pub timing: CardTiming,
}

/// A card's output document: a business payload plus the uniform envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardOutput {
    pub data: Value,
    pub meta: CardMeta,
}

impl CardOutput {
    pub fn new(data: Value) -> Self {
        CardOutput {
            data,
            meta: CardMeta::default(),
        }
    }

    pub fn fallback(data: Value, code: impl Into<String>) -> Self {
        CardOutput {
            data,
            meta: CardMeta {
                fallback: true,
                code: Some(code.into()),
                ..CardMeta::default()
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.meta.fallback
    }

    /// Prunes empty object/array/null leaves from `data` in place, unless
    /// `preserve_empty` is set. Business cards must always pass
    /// `preserve_empty=true` before calling this (§4.7, §8 invariant 4).
    pub fn prune_if_allowed(&mut self) {
        if self.meta.preserve_empty {
            return;
        }
        if let Some(pruned) = prune_empty(&self.data) {
            self.data = pruned;
        }
    }
}

fn prune_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                match prune_empty(v) {
                    Some(pruned) if !is_empty(&pruned) => {
                        out.insert(k.clone(), pruned);
                    }
                    None if !is_empty(v) => {
                        out.insert(k.clone(), v.clone());
                    }
                    _ => {}
                }
            }
            Some(Value::Object(out))
        }
        other => Some(other.clone()),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// A planned or running unit of work within one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub job_id: Uuid,
    pub card_type: String,
    pub priority: i32,
    pub concurrency_group: String,
    pub deadline_ms: Option<u64>,
    pub deps: BTreeSet<String>,
    pub status: CardStatus,
    pub retry_count: u32,
    /// `true` for resource/internal cards; `false` for user-visible business cards.
    pub internal: bool,
    pub output: Option<CardOutput>,
}

impl Card {
    pub fn new(
        job_id: Uuid,
        card_type: impl Into<String>,
        priority: i32,
        concurrency_group: impl Into<String>,
        deps: BTreeSet<String>,
        internal: bool,
    ) -> Self {
        Card {
            id: Uuid::new_v4(),
            job_id,
            card_type: card_type.into(),
            priority,
            concurrency_group: concurrency_group.into(),
            deadline_ms: None,
            deps,
            status: CardStatus::Pending,
            retry_count: 0,
            internal,
            output: None,
        }
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Given the set of card_types already in a terminal, dependent-satisfying
    /// state, is this card ready to run?
    pub fn deps_satisfied(&self, completed_types: &BTreeSet<String>) -> bool {
        self.deps.iter().all(|dep| completed_types.contains(dep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn business_card_output_never_collapses_declared_keys() {
        let mut out = CardOutput::new(serde_json::json!({"papers": [], "summary": ""}));
        out.meta.preserve_empty = true;
        out.prune_if_allowed();
        assert_eq!(out.data, serde_json::json!({"papers": [], "summary": ""}));
    }

    #[test]
    fn internal_card_output_prunes_empty_leaves() {
        let mut out = CardOutput::new(serde_json::json!({"raw": {}, "count": 3, "tags": []}));
        out.prune_if_allowed();
        assert_eq!(out.data, serde_json::json!({"count": 3}));
    }

    #[test]
    fn deps_satisfied_requires_all() {
        let mut deps = BTreeSet::new();
        deps.insert("profile".to_string());
        deps.insert("papers".to_string());
        let card = Card::new(job_id(), "summary", 0, "llm", deps, false);

        let mut have = BTreeSet::new();
        have.insert("profile".to_string());
        assert!(!card.deps_satisfied(&have));

        have.insert("papers".to_string());
        assert!(card.deps_satisfied(&have));
    }

    #[test]
    fn skipped_dependency_still_satisfies_dependents() {
        assert!(CardStatus::Skipped.satisfies_dependents());
        assert!(!CardStatus::Failed.satisfies_dependents());
    }

    #[test]
    fn fallback_output_is_marked() {
        let out = CardOutput::fallback(serde_json::json!({}), "upstream_unavailable");
        assert!(out.is_fallback());
        assert_eq!(out.meta.code.as_deref(), Some("upstream_unavailable"));
    }
}
