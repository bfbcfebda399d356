//! The worker loop: claims queued jobs, plans their card DAG, and drives
//! them through the [`Scheduler`], the same "dumb poller, policy lives
//! outside" split `analysis_core::refresh_pool` uses for background
//! refreshes. Kept out of the request handler so `POST /analyze` stays a
//! thin boundary (§1 scope, §2 request flow).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::card::Card;
use analysis_core::event::{Event, EventType};
use analysis_core::job::{Job, JobStatus};
use analysis_core::planner::{validate_plan, PlannedCard, PlannerRegistry};
use analysis_core::refresh_pool::RefreshRequest;
use analysis_core::scheduler::{RunOutcome, Scheduler};
use analysis_core::{content_hash_of, AnalysisError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use analysis_api::state::AppState;

/// How long the loop sleeps after finding an empty queue. Claiming is a
/// poll, not a push, so there is no backplane wake-up for "a job was
/// queued" the way there is one for "an event was appended" (§5).
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(250);

/// Runs forever, claiming one queued job at a time and driving it to
/// completion. Intended to be `tokio::spawn`ed once per process; multiple
/// processes may run this concurrently since `claim_next_queued` is a
/// compare-and-set (§8 invariant 3's sibling guarantee, applied to jobs
/// instead of cards).
pub async fn run_loop(state: Arc<AppState>, planners: Arc<PlannerRegistry>) {
    loop {
        match state.store.claim_next_queued().await {
            Ok(Some(job)) => {
                let job_id = job.id;
                if let Err(err) = run_one(&state, &planners, job).await {
                    error!(%job_id, error = %err, "worker loop failed to drive job");
                }
            }
            Ok(None) => tokio::time::sleep(EMPTY_QUEUE_BACKOFF).await,
            Err(err) => {
                warn!(error = %err, "claim_next_queued failed, backing off");
                tokio::time::sleep(EMPTY_QUEUE_BACKOFF).await;
            }
        }
    }
}

#[instrument(skip(state, planners, job), fields(job_id = %job.id, source = %job.source))]
async fn run_one(
    state: &Arc<AppState>,
    planners: &Arc<PlannerRegistry>,
    job: Job,
) -> Result<(), AnalysisError> {
    let planner = match planners.get(&job.source) {
        Some(planner) => planner,
        None => {
            fail_job(state, &job, "no planner registered for this source").await?;
            return Ok(());
        }
    };

    let requested: HashSet<String> = job.requested_cards.iter().cloned().collect();
    let planned = match planner.plan(&requested, &job.options, &job.input) {
        Ok(planned) => planned,
        Err(err) => {
            fail_job(state, &job, &err.to_string()).await?;
            return Ok(());
        }
    };
    if let Err(err) = validate_plan(&*planner, &planned, &requested) {
        fail_job(state, &job, &err.to_string()).await?;
        return Ok(());
    }

    let (scheduled, background): (Vec<PlannedCard>, Vec<PlannedCard>) =
        planned.into_iter().partition(|c| !c.background_only);
    match &state.refresh_sink {
        Some(sink) => {
            for card in &background {
                info!(card_type = %card.card_type, "routing background-only card to the refresh pool");
                sink.enqueue(RefreshRequest {
                    source: job.source.clone(),
                    subject_key: job.subject_key.clone(),
                    options: job.options.clone(),
                });
            }
        }
        None => {
            for card in &background {
                info!(card_type = %card.card_type, "no refresh pool wired in, dropping background-only card");
            }
        }
    }

    let cards: Vec<Card> = scheduled
        .into_iter()
        .map(|planned| to_card(job.id, planned))
        .collect();
    state
        .store
        .insert_cards(cards.clone())
        .await
        .map_err(|e| AnalysisError::Internal(e.into()))?;

    state
        .log
        .append(Event::unsequenced(job.id, EventType::JobStarted, None, Value::Null))
        .await
        .map_err(|e| AnalysisError::Internal(e.into()))?;

    let scheduler = Scheduler::new(
        state.store.clone(),
        state.log.clone(),
        state.handlers.clone(),
        state.config.clone(),
    )
    .with_wake_bus(state.wake.clone());

    let outcome: RunOutcome = scheduler.run_job(&job, cards, CancellationToken::new()).await?;

    if matches!(outcome.job_status, JobStatus::Completed | JobStatus::Partial) {
        let report = assemble_report(&outcome.cards);
        let fingerprint = content_hash_of(&report);
        state
            .cache_controller()
            .after_run(&job, report, fingerprint)
            .await?;
    }
    Ok(())
}

async fn fail_job(state: &Arc<AppState>, job: &Job, reason: &str) -> Result<(), AnalysisError> {
    warn!(job_id = %job.id, reason, "job failed before scheduling");
    state
        .store
        .set_job_status(job.id, JobStatus::Failed, Some(serde_json::json!({"reason": reason})))
        .await
        .map_err(|e| AnalysisError::Internal(e.into()))?;
    state
        .log
        .append(Event::unsequenced(
            job.id,
            EventType::JobFailed,
            None,
            serde_json::json!({"reason": reason}),
        ))
        .await
        .map_err(|e| AnalysisError::Internal(e.into()))?;
    Ok(())
}

fn to_card(job_id: uuid::Uuid, planned: PlannedCard) -> Card {
    let mut card = Card::new(
        job_id,
        planned.card_type,
        planned.priority,
        planned.concurrency_group,
        planned.deps,
        planned.internal,
    );
    if let Some(deadline_ms) = planned.deadline_ms {
        card = card.with_deadline_ms(deadline_ms);
    }
    card
}

/// Merges completed business cards into the `full_report` payload written
/// through to the artifact cache (§4.3, §4.8), keyed by card type.
fn assemble_report(cards: &[Card]) -> Value {
    let mut report = serde_json::Map::new();
    for card in cards {
        if card.internal {
            continue;
        }
        if let Some(output) = &card.output {
            report.insert(card.card_type.clone(), output.data.clone());
        }
    }
    Value::Object(report)
}
