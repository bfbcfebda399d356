//! End-to-end scheduler scenarios (§8), run against the in-memory backends
//! in this crate so no database is required.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use analysis_core::card::{Card, CardStatus};
use analysis_core::error::AnalysisError;
use analysis_core::event::EventType;
use analysis_core::handler::{CardResult, Handler, HandlerContext, HandlerRegistry};
use analysis_core::job::{Job, RequestOptions};
use analysis_core::source::Source;
use analysis_core::store::JobStore;
use analysis_core::{AnalysisConfig, Scheduler};
use analysis_testing::{InMemoryEventLog, InMemoryJobStore};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct EchoHandler {
    card_type: &'static str,
}

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(&self, ctx: &HandlerContext) -> Result<CardResult, AnalysisError> {
        Ok(CardResult::ok(serde_json::json!({ self.card_type: ctx.input.clone() })))
    }

    async fn fallback(&self, _ctx: &HandlerContext, _error: Option<&AnalysisError>) -> CardResult {
        CardResult::fallback(serde_json::json!({}), "upstream_unavailable")
    }
}

/// Always fails `execute`, exercising the quality gate's fallback path.
struct AlwaysFailsHandler;

#[async_trait]
impl Handler for AlwaysFailsHandler {
    async fn execute(&self, _ctx: &HandlerContext) -> Result<CardResult, AnalysisError> {
        Err(AnalysisError::UpstreamUnavailable {
            source_name: "scholar".to_string(),
            cause: anyhow::anyhow!("connection refused"),
        })
    }

    async fn fallback(&self, _ctx: &HandlerContext, error: Option<&AnalysisError>) -> CardResult {
        let code = error.map(|_| "upstream_unavailable").unwrap_or("unknown");
        CardResult::fallback(serde_json::json!({"summary": ""}), code)
    }
}

/// Fails twice, then succeeds, counting invocations so the test can assert
/// the retry budget was actually exercised.
struct FlakyHandler {
    attempts: AtomicUsize,
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn execute(&self, ctx: &HandlerContext) -> Result<CardResult, AnalysisError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            return Err(AnalysisError::UpstreamUnavailable {
                source_name: "scholar".to_string(),
                cause: anyhow::anyhow!("503"),
            });
        }
        Ok(CardResult::ok(ctx.input.clone()))
    }

    async fn fallback(&self, _ctx: &HandlerContext, _error: Option<&AnalysisError>) -> CardResult {
        CardResult::fallback(serde_json::json!({}), "upstream_unavailable")
    }
}

fn cards_for(job_id: Uuid, card_types: &[&str]) -> Vec<Card> {
    let mut cards = Vec::new();
    let mut deps = BTreeSet::new();
    for card_type in card_types {
        let internal = *card_type == "profile";
        let card = Card::new(job_id, *card_type, 0, "default", deps.clone(), internal);
        cards.push(card);
        deps.insert(card_type.to_string());
    }
    cards
}

/// Creates a job through the store (so the store and the scheduler agree on
/// its id), inserts cards for the given card types, and returns everything
/// needed to run the scheduler against it.
async fn seed_job(
    card_types: &[&str],
) -> (Job, Vec<Card>, Arc<InMemoryJobStore>) {
    let store = Arc::new(InMemoryJobStore::new());
    let job = store
        .create_job(
            "user-1",
            Source::Scholar,
            "id:ABCDEF",
            serde_json::json!({"content": "Y-ql3zMAAAAJ"}),
            RequestOptions::default(),
            Vec::new(),
            None,
        )
        .await
        .unwrap();
    let cards = cards_for(job.id, card_types);
    store.insert_cards(cards.clone()).await.unwrap();
    (job, cards, store)
}

async fn run(
    job: &Job,
    cards: Vec<Card>,
    store: Arc<InMemoryJobStore>,
    handlers: HandlerRegistry,
) -> (analysis_core::scheduler::RunOutcome, Arc<InMemoryEventLog>, Arc<InMemoryJobStore>) {
    let log = Arc::new(InMemoryEventLog::new());
    let config = Arc::new(AnalysisConfig::default());
    let scheduler = Scheduler::new(store.clone(), log.clone(), Arc::new(handlers), config);

    let outcome = scheduler
        .run_job(job, cards, CancellationToken::new())
        .await
        .unwrap();
    (outcome, log, store)
}

/// E1: a cold run over a linear profile -> papers -> summary chain
/// completes every business card and ends in `job.completed`.
#[tokio::test]
async fn e1_cold_run_completes_all_cards_in_order() {
    let (job, cards, store) = seed_job(&["profile", "papers", "summary"]).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "profile", Arc::new(EchoHandler { card_type: "profile" }));
    handlers.register(Source::Scholar, "papers", Arc::new(EchoHandler { card_type: "papers" }));
    handlers.register(Source::Scholar, "summary", Arc::new(EchoHandler { card_type: "summary" }));

    let (outcome, log, _store) = run(&job, cards, store, handlers).await;

    assert_eq!(outcome.job_status, analysis_core::job::JobStatus::Completed);
    assert!(outcome.cards.iter().all(|c| c.status == CardStatus::Completed));

    let events = log.tail_from(job.id, 0, 100).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::JobStarted));
    assert!(events.iter().any(|e| e.event_type == EventType::JobCompleted));
    let completed_count = events
        .iter()
        .filter(|e| e.event_type == EventType::CardCompleted)
        .count();
    assert_eq!(completed_count, 3);
    assert!(events.iter().all(|e| e.event_type != EventType::CardPrefill));

    // Invariant 1: sequence totality — {1, ..., last_seq} with no gaps.
    let mut seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    seqs.sort_unstable();
    let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
    assert_eq!(seqs, expected);
}

/// E4 / quality gate: a business card whose handler fails past the retry
/// budget still completes, with `is_fallback=true`, and the job is
/// `partial` rather than `failed`; unrelated cards are unaffected.
#[tokio::test]
async fn e4_exhausted_retries_yield_fallback_and_partial_job() {
    let (job, cards, store) = seed_job(&["profile", "summary"]).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "profile", Arc::new(EchoHandler { card_type: "profile" }));
    handlers.register(Source::Scholar, "summary", Arc::new(AlwaysFailsHandler));

    let (outcome, log, _store) = run(&job, cards, store, handlers).await;

    assert_eq!(outcome.job_status, analysis_core::job::JobStatus::Partial);
    let summary = outcome
        .cards
        .iter()
        .find(|c| c.card_type == "summary")
        .unwrap();
    assert_eq!(summary.status, CardStatus::Completed);
    assert!(summary.output.as_ref().unwrap().is_fallback());
    assert!(summary.output.as_ref().unwrap().meta.code.is_some());

    let profile = outcome
        .cards
        .iter()
        .find(|c| c.card_type == "profile")
        .unwrap();
    assert!(!profile.output.as_ref().unwrap().is_fallback());

    let events = log.tail_from(job.id, 0, 100).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::JobPartial));
    // Exactly one completed/terminal event per card, never both.
    let completed_count = events
        .iter()
        .filter(|e| e.event_type == EventType::CardCompleted)
        .count();
    assert_eq!(completed_count, 2);
}

/// A handler that fails twice and succeeds on the third attempt is retried
/// within budget rather than immediately falling back.
#[tokio::test]
async fn flaky_handler_recovers_within_retry_budget() {
    let (job, cards, store) = seed_job(&["profile"]).await;

    let flaky = Arc::new(FlakyHandler { attempts: AtomicUsize::new(0) });
    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "profile", flaky.clone());

    let (outcome, _log, _store) = run(&job, cards, store, handlers).await;

    assert_eq!(outcome.job_status, analysis_core::job::JobStatus::Completed);
    let card = &outcome.cards[0];
    assert!(!card.output.as_ref().unwrap().is_fallback());
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
}

/// E5: cancelling before the scheduler starts its loop means no cards are
/// ever claimed, and the run still ends in the terminal `cancelled` state.
#[tokio::test]
async fn e5_cancellation_short_circuits_and_ends_cancelled() {
    let (job, cards, store) = seed_job(&["profile", "summary"]).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "profile", Arc::new(EchoHandler { card_type: "profile" }));
    handlers.register(Source::Scholar, "summary", Arc::new(EchoHandler { card_type: "summary" }));

    let log = Arc::new(InMemoryEventLog::new());
    let config = Arc::new(AnalysisConfig::default());
    let scheduler = Scheduler::new(store.clone(), log.clone(), Arc::new(handlers), config);

    let token = CancellationToken::new();
    token.cancel();
    let outcome = scheduler.run_job(&job, cards, token).await.unwrap();

    assert_eq!(outcome.job_status, analysis_core::job::JobStatus::Cancelled);
    assert!(outcome.cards.iter().all(|c| c.status.is_terminal()));

    let events = log.tail_from(job.id, 0, 100).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::JobCancelled));
    assert!(events.iter().all(|e| e.event_type != EventType::CardStarted));
}

/// E6: resuming with an `after` cursor yields exactly the events with
/// `seq > after`, in order, with no duplicates.
#[tokio::test]
async fn e6_resume_from_cursor_yields_only_newer_events() {
    let (job, cards, store) = seed_job(&["profile", "papers"]).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "profile", Arc::new(EchoHandler { card_type: "profile" }));
    handlers.register(Source::Scholar, "papers", Arc::new(EchoHandler { card_type: "papers" }));

    let (_outcome, log, _store) = run(&job, cards, store, handlers).await;

    let all = log.tail_from(job.id, 0, 1000).await.unwrap();
    assert!(all.len() >= 4);
    let cursor = all[1].seq;

    let resumed = log.tail_from(job.id, cursor, 1000).await.unwrap();
    let expected: Vec<Uuid> = all.iter().filter(|e| e.seq > cursor).map(|e| e.id).collect();
    let actual: Vec<Uuid> = resumed.iter().map(|e| e.id).collect();
    assert_eq!(actual, expected);
    assert!(resumed.iter().all(|e| e.seq > cursor));

    let mut seen = std::collections::HashSet::new();
    assert!(resumed.iter().all(|e| seen.insert(e.id)));
}

/// Invariant 4: a business card's completed output never loses its
/// declared top-level keys to pruning, even when the handler reports an
/// all-empty payload.
#[tokio::test]
async fn business_card_retains_empty_declared_keys() {
    struct EmptyPayloadHandler;

    #[async_trait]
    impl Handler for EmptyPayloadHandler {
        async fn execute(&self, _ctx: &HandlerContext) -> Result<CardResult, AnalysisError> {
            Ok(CardResult::ok(serde_json::json!({"papers": [], "summary": ""})))
        }

        async fn fallback(&self, _ctx: &HandlerContext, _error: Option<&AnalysisError>) -> CardResult {
            CardResult::fallback(serde_json::json!({}), "upstream_unavailable")
        }
    }

    let (job, cards, store) = seed_job(&["papers"]).await;
    let mut handlers = HandlerRegistry::new();
    handlers.register(Source::Scholar, "papers", Arc::new(EmptyPayloadHandler));

    let (outcome, _log, _store) = run(&job, cards, store, handlers).await;

    let card = &outcome.cards[0];
    assert!(!card.internal);
    assert_eq!(
        card.output.as_ref().unwrap().data,
        serde_json::json!({"papers": [], "summary": ""})
    );
}
