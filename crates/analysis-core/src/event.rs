//! The append-only per-job [`Event`] log entry type (§4.1, §6 taxonomy).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed event-type vocabulary. Dotted wire names match spec §6 exactly;
/// readers must treat this set as closed, never emitting anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "card.ready")]
    CardReady,
    #[serde(rename = "card.started")]
    CardStarted,
    #[serde(rename = "card.prefill")]
    CardPrefill,
    #[serde(rename = "card.progress")]
    CardProgress,
    #[serde(rename = "card.delta")]
    CardDelta,
    #[serde(rename = "card.append")]
    CardAppend,
    #[serde(rename = "card.completed")]
    CardCompleted,
    #[serde(rename = "card.failed")]
    CardFailed,
    #[serde(rename = "refresh.started")]
    RefreshStarted,
    #[serde(rename = "refresh.ended")]
    RefreshEnded,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.partial")]
    JobPartial,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventType {
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobCompleted
                | EventType::JobPartial
                | EventType::JobFailed
                | EventType::JobCancelled
        )
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobStarted => "job.started",
            EventType::CardReady => "card.ready",
            EventType::CardStarted => "card.started",
            EventType::CardPrefill => "card.prefill",
            EventType::CardProgress => "card.progress",
            EventType::CardDelta => "card.delta",
            EventType::CardAppend => "card.append",
            EventType::CardCompleted => "card.completed",
            EventType::CardFailed => "card.failed",
            EventType::RefreshStarted => "refresh.started",
            EventType::RefreshEnded => "refresh.ended",
            EventType::JobCompleted => "job.completed",
            EventType::JobPartial => "job.partial",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
            EventType::Heartbeat => "heartbeat",
        }
    }
}

/// One record in a job's strictly-increasing event sequence. `seq` is
/// assigned by the [`crate::event_log::EventLog`] writer, never by the
/// caller — constructors here leave it at the sentinel `0` until appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub job_id: Uuid,
    pub seq: i64,
    pub event_type: EventType,
    pub card_id: Option<Uuid>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Builds an unsequenced event ready to hand to `EventLog::append`.
    pub fn unsequenced(
        job_id: Uuid,
        event_type: EventType,
        card_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Event {
            id: Uuid::new_v4(),
            job_id,
            seq: 0,
            event_type,
            card_id,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_spec_taxonomy() {
        assert_eq!(EventType::JobCreated.wire_name(), "job.created");
        assert_eq!(EventType::CardPrefill.wire_name(), "card.prefill");
        assert_eq!(EventType::Heartbeat.wire_name(), "heartbeat");
    }

    #[test]
    fn only_job_terminal_events_are_flagged_terminal() {
        assert!(EventType::JobCompleted.is_job_terminal());
        assert!(EventType::JobCancelled.is_job_terminal());
        assert!(!EventType::CardCompleted.is_job_terminal());
        assert!(!EventType::Heartbeat.is_job_terminal());
    }

    #[test]
    fn serde_round_trip_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::CardDelta).unwrap();
        assert_eq!(json, "\"card.delta\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::CardDelta);
    }
}
