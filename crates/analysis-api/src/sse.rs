//! SSE fan-out (§4.4), modeled directly on the teacher's
//! `kernel/sse.rs`: tail the event log from an `after` cursor, forward a
//! wake-up ping to collapse poll latency, heartbeat on idle, and close on
//! a job-terminal event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::event::EventType;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::interval;
use uuid::Uuid;

use crate::routes::JobPathParams;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub after: i64,
}

pub async fn stream_job(
    State(state): State<Arc<AppState>>,
    Path(params): Path<JobPathParams>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let job_id = params.id;
    let after = query.after;
    let poll_interval = state.config.sse_poll_interval;
    let heartbeat_interval = state.config.sse_heartbeat_interval;
    let log = state.log.clone();
    let mut wake_rx = state.wake.subscribe();

    let stream = stream::unfold(
        (after, false, interval(heartbeat_interval)),
        move |(cursor, mut closed, mut heartbeat)| {
            let log = log.clone();
            let mut wake_rx_clone = wake_rx.resubscribe();
            async move {
                if closed {
                    return None;
                }

                loop {
                    let batch = log.tail_from(job_id, cursor, 100).await.unwrap_or_default();
                    if !batch.is_empty() {
                        let mut next_cursor = cursor;
                        let mut frames = Vec::with_capacity(batch.len());
                        let mut should_close = false;
                        for event in batch {
                            next_cursor = event.seq;
                            should_close |= event.event_type.is_job_terminal();
                            frames.push(to_sse_event(&event.event_type, &json!({
                                "seq": event.seq,
                                "event_type": event.event_type.wire_name(),
                                "card_id": event.card_id,
                                "payload": event.payload,
                            })));
                        }
                        closed = should_close;
                        return Some((
                            stream::iter(frames.into_iter().map(Ok::<_, Infallible>)),
                            (next_cursor, closed, heartbeat),
                        ));
                    }

                    tokio::select! {
                        _ = heartbeat.tick() => {
                            let frame = SseEvent::default().event("heartbeat").data("{}");
                            return Some((
                                stream::iter(vec![Ok::<_, Infallible>(frame)]),
                                (cursor, closed, heartbeat),
                            ));
                        }
                        woken = wake_rx_clone.recv() => {
                            if matches!(woken, Ok(id) if id == job_id) {
                                continue;
                            }
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        },
    )
    .flatten();

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse_event(event_type: &EventType, payload: &serde_json::Value) -> SseEvent {
    SseEvent::default()
        .event(event_type.wire_name())
        .data(payload.to_string())
}
