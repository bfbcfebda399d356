//! The [`Scheduler`]: concurrency-group-limited, priority-ordered card
//! executor (§4.7). Structured as an explicit state-machine loop per §9
//! design note ("coroutine/callback mix -> explicit state machine"),
//! rather than the teacher's generic actor-style `Runtime`/`Engine`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::card::{Card, CardOutput, CardStatus};
use crate::config::AnalysisConfig;
use crate::error::{sanitize, AnalysisError};
use crate::event::{Event, EventType};
use crate::event_log::EventLog;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::job::{Job, JobStatus};
use crate::store::JobStore;

/// Per-job runtime state the scheduler threads through its loop: the
/// published intra-job artifact map (§5 "published as named artifacts in
/// a job-local read-mostly map") and the running `last_seq` counter.
struct JobRuntime {
    artifacts: Mutex<HashMap<String, Value>>,
    last_seq: AtomicI64,
    cancellation: CancellationToken,
}

/// Budget table shared across jobs, keyed by concurrency group name
/// (teacher's `dashmap` idiom throughout `seesaw-rs`).
#[derive(Clone)]
pub struct ConcurrencyBudgets {
    groups: Arc<DashMap<String, Arc<Semaphore>>>,
    limits: Arc<HashMap<String, usize>>,
}

impl ConcurrencyBudgets {
    pub fn new(limits: HashMap<String, usize>) -> Self {
        ConcurrencyBudgets {
            groups: Arc::new(DashMap::new()),
            limits: Arc::new(limits),
        }
    }

    /// Returns the semaphore for a group, creating it lazily. Groups with
    /// no configured limit are effectively unlimited (a very large permit
    /// count), matching §4.7's `resource=unlimited` example.
    fn semaphore(&self, group: &str) -> Arc<Semaphore> {
        if let Some(existing) = self.groups.get(group) {
            return existing.clone();
        }
        let limit = self.limits.get(group).copied().unwrap_or(usize::MAX / 2);
        let sem = Arc::new(Semaphore::new(limit));
        self.groups.insert(group.to_string(), sem.clone());
        sem
    }
}

/// Outcome of running one job to completion, used by the caller (e.g. the
/// cache controller or request API) to decide the final job status.
pub struct RunOutcome {
    pub job_status: JobStatus,
    pub cards: Vec<Card>,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    handlers: Arc<HandlerRegistry>,
    config: Arc<AnalysisConfig>,
    budgets: ConcurrencyBudgets,
    worker_permits: Arc<Semaphore>,
    wake: Option<crate::bus::WakeBus>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        log: Arc<dyn EventLog>,
        handlers: Arc<HandlerRegistry>,
        config: Arc<AnalysisConfig>,
    ) -> Self {
        let budgets = ConcurrencyBudgets::new(config.concurrency_budgets.clone());
        let worker_permits = Arc::new(Semaphore::new(config.worker_pool_size));
        Scheduler {
            store,
            log,
            handlers,
            config,
            budgets,
            worker_permits,
            wake: None,
        }
    }

    pub fn with_wake_bus(mut self, wake: crate::bus::WakeBus) -> Self {
        self.wake = Some(wake);
        self
    }

    async fn append(&self, runtime: &JobRuntime, event: Event) -> Result<(), AnalysisError> {
        let stored = self
            .log
            .append(event)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        runtime.last_seq.store(stored.seq, Ordering::SeqCst);
        self.store
            .bump_last_seq(stored.job_id, stored.seq)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        if let Some(wake) = &self.wake {
            wake.wake(stored.job_id);
        }
        Ok(())
    }

    /// Drives one job's cards to completion: ready-set maintenance, claim,
    /// execute-with-deadline, retry/fallback quality gate, pruning, and
    /// terminal job status derivation (§4.7).
    #[instrument(skip(self, job, cards, cancellation), fields(job_id = %job.id))]
    pub async fn run_job(
        &self,
        job: &Job,
        mut cards: Vec<Card>,
        cancellation: CancellationToken,
    ) -> Result<RunOutcome, AnalysisError> {
        let runtime = Arc::new(JobRuntime {
            artifacts: Mutex::new(HashMap::new()),
            last_seq: AtomicI64::new(job.last_seq),
            cancellation,
        });

        self.append(
            &runtime,
            Event::unsequenced(job.id, EventType::JobStarted, None, Value::Null),
        )
        .await?;

        loop {
            if runtime.cancellation.is_cancelled() {
                self.cancel_in_flight(job, &mut cards, &runtime).await?;
                break;
            }

            let completed_types: BTreeSet<String> = cards
                .iter()
                .filter(|c| c.status.satisfies_dependents())
                .map(|c| c.card_type.clone())
                .collect();

            let ready_ids: Vec<Uuid> = cards
                .iter()
                .filter(|c| c.status == CardStatus::Pending && c.deps_satisfied(&completed_types))
                .map(|c| c.id)
                .collect();

            if ready_ids.is_empty() {
                if cards.iter().all(|c| c.status.is_terminal()) {
                    break;
                }
                // Every handle spawned this tick was already awaited above,
                // so a non-terminal card here isn't "in flight" — it's
                // pending on a dependency that ended `Failed` (the quality
                // gate keeps handler-side failures out of this state; this
                // is an infra-level failure, e.g. a store write that
                // errored). That dependency will never satisfy, so these
                // cards would otherwise sit `Pending` forever and
                // `derive_job_status` would never see them. Fail them
                // outright instead of spinning.
                self.fail_blocked_cards(job, &mut cards, &runtime).await?;
                break;
            }

            let mut handles = Vec::with_capacity(ready_ids.len());
            for card_id in ready_ids {
                let idx = cards.iter().position(|c| c.id == card_id).unwrap();
                cards[idx].status = CardStatus::Ready;

                let claimed = self
                    .store
                    .claim_card(card_id)
                    .await
                    .map_err(|e| AnalysisError::Internal(e.into()))?;
                if !claimed {
                    continue;
                }
                cards[idx].status = CardStatus::Running;

                let card = cards[idx].clone();
                let sched = self.clone_for_task();
                let runtime = runtime.clone();
                let job = job.clone();
                handles.push(tokio::spawn(async move {
                    let result = sched.run_card(&job, &card, &runtime).await;
                    (card, result)
                }));
            }

            for handle in handles {
                let (card, result) = handle
                    .await
                    .map_err(|e| AnalysisError::Internal(anyhow::anyhow!(e)))?;
                let idx = cards.iter().position(|c| c.id == card.id).unwrap();
                match result {
                    Ok(final_status) => cards[idx].status = final_status,
                    Err(err) => {
                        warn!(card_type = %card.card_type, error = %err, "card execution failed internally");
                        cards[idx].status = CardStatus::Failed;
                    }
                }
            }
        }

        let job_status = self.derive_job_status(job, &cards, runtime.cancellation.is_cancelled());
        let terminal_event = match job_status {
            JobStatus::Completed => EventType::JobCompleted,
            JobStatus::Partial => EventType::JobPartial,
            JobStatus::Failed => EventType::JobFailed,
            JobStatus::Cancelled => EventType::JobCancelled,
            other => {
                warn!(?other, "non-terminal job status at end of run_job loop");
                EventType::JobFailed
            }
        };
        self.append(
            &runtime,
            Event::unsequenced(job.id, terminal_event, None, Value::Null),
        )
        .await?;
        self.store
            .set_job_status(job.id, job_status, None)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        info!(?job_status, "job run complete");
        Ok(RunOutcome { job_status, cards })
    }

    /// Cheap clone carrying only the `Arc`s needed inside a spawned task.
    fn clone_for_task(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            store: self.store.clone(),
            log: self.log.clone(),
            handlers: self.handlers.clone(),
            config: self.config.clone(),
            budgets: self.budgets.clone(),
            worker_permits: self.worker_permits.clone(),
            wake: self.wake.clone(),
        })
    }

    async fn cancel_in_flight(
        &self,
        _job: &Job,
        cards: &mut [Card],
        _runtime: &JobRuntime,
    ) -> Result<(), AnalysisError> {
        tokio::time::sleep(self.config.cancellation_grace_window).await;
        for card in cards.iter_mut() {
            if !card.status.is_terminal() {
                card.status = CardStatus::Skipped;
                self.store
                    .finish_card(card.id, CardStatus::Skipped, None, card.retry_count, 0)
                    .await
                    .map_err(|e| AnalysisError::Internal(e.into()))?;
            }
        }
        Ok(())
    }

    /// Fails every non-terminal card once the ready set has gone dry with
    /// work still outstanding — the dependency it waits on ended `Failed`
    /// and will never satisfy it (§4.7: only infra-level failures reach
    /// `Failed`, since the quality gate always completes handler-side
    /// failures with a fallback).
    async fn fail_blocked_cards(
        &self,
        job: &Job,
        cards: &mut [Card],
        runtime: &JobRuntime,
    ) -> Result<(), AnalysisError> {
        for card in cards.iter_mut() {
            if card.status.is_terminal() {
                continue;
            }
            card.status = CardStatus::Failed;
            self.store
                .finish_card(card.id, CardStatus::Failed, None, card.retry_count, 0)
                .await
                .map_err(|e| AnalysisError::Internal(e.into()))?;
            self.append(
                runtime,
                Event::unsequenced(
                    job.id,
                    EventType::CardFailed,
                    Some(card.id),
                    serde_json::json!({"reason": "blocked on a dependency that failed"}),
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Executes one claimed card end to end: `card.started`, the worker
    /// permit + concurrency-group budget, `execute` under a deadline,
    /// `validate`, retry/fallback quality gate, `normalize`, pruning, and
    /// persistence (§4.7 execution wrapper).
    async fn run_card(
        self: Arc<Self>,
        job: &Job,
        card: &Card,
        runtime: &JobRuntime,
    ) -> Result<CardStatus, AnalysisError> {
        let _worker_permit = self
            .worker_permits
            .acquire()
            .await
            .map_err(|e| AnalysisError::Internal(anyhow::anyhow!(e)))?;
        let group_sem = self.budgets.semaphore(&card.concurrency_group);
        let _group_permit = group_sem
            .acquire()
            .await
            .map_err(|e| AnalysisError::Internal(anyhow::anyhow!(e)))?;

        self.append(
            runtime,
            Event::unsequenced(job.id, EventType::CardStarted, Some(card.id), Value::Null),
        )
        .await?;

        let Some(handler) = self.handlers.get(&job.source, &card.card_type) else {
            let err = AnalysisError::Internal(anyhow::anyhow!(
                "no handler registered for ({}, {})",
                job.source,
                card.card_type
            ));
            return self.complete_with_fallback(job, card, runtime, &err).await;
        };

        let artifacts = runtime.artifacts.lock().await.clone();
        let ctx = HandlerContext {
            input: job.input.clone(),
            options: job.options.clone(),
            artifacts: Arc::new(artifacts),
            cancellation: runtime.cancellation.clone(),
        };

        let deadline = self.config.deadline_for(&card.card_type);
        let mut retry_count = 0u32;
        let mut last_err: Option<AnalysisError> = None;

        loop {
            let attempt = tokio::time::timeout(deadline, handler.execute(&ctx)).await;
            match attempt {
                Ok(Ok(result)) => {
                    let accepted = result.skip_validation || handler.validate(&result, &ctx).await;
                    if accepted {
                        let normalized = handler.normalize(result);
                        return self
                            .complete_success(job, card, runtime, normalized)
                            .await;
                    }
                    last_err = Some(AnalysisError::ValidationFailed(card.card_type.clone()));
                }
                Ok(Err(err)) => {
                    last_err = Some(err);
                }
                Err(_elapsed) => {
                    last_err = Some(AnalysisError::Timeout {
                        elapsed_ms: deadline.as_millis() as u64,
                    });
                }
            }

            if runtime.cancellation.is_cancelled() {
                return Ok(CardStatus::Skipped);
            }
            if retry_count >= self.config.max_card_retries {
                let err = last_err.unwrap_or(AnalysisError::Internal(anyhow::anyhow!("unknown")));
                return self.complete_with_fallback(job, card, runtime, &err).await;
            }
            retry_count += 1;
            tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(retry_count))).await;
        }
    }

    async fn complete_success(
        &self,
        job: &Job,
        card: &Card,
        runtime: &JobRuntime,
        result: crate::handler::CardResult,
    ) -> Result<CardStatus, AnalysisError> {
        let mut output = result.into_output(!card.internal);
        output.meta.timing.start();
        output.meta.timing.finish();
        output.prune_if_allowed();

        runtime
            .artifacts
            .lock()
            .await
            .insert(card.card_type.clone(), output.data.clone());

        self.store
            .finish_card(card.id, CardStatus::Completed, Some(output.clone()), 0, 0)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        self.append(
            runtime,
            Event::unsequenced(
                job.id,
                EventType::CardCompleted,
                Some(card.id),
                serde_json::to_value(&output).unwrap_or(Value::Null),
            ),
        )
        .await?;

        Ok(CardStatus::Completed)
    }

    /// The quality gate's terminal action: a card whose retry budget is
    /// exhausted always completes with `is_fallback=true`, never fails,
    /// unless the handler's own fallback cannot be constructed at all
    /// (§4.7 quality gate, §7 propagation policy).
    async fn complete_with_fallback(
        &self,
        job: &Job,
        card: &Card,
        runtime: &JobRuntime,
        error: &AnalysisError,
    ) -> Result<CardStatus, AnalysisError> {
        let (code, _message) = sanitize(error);
        let handler = self.handlers.get(&job.source, &card.card_type);

        let mut output = match handler {
            Some(handler) => {
                let artifacts = runtime.artifacts.lock().await.clone();
                let ctx = HandlerContext {
                    input: job.input.clone(),
                    options: job.options.clone(),
                    artifacts: Arc::new(artifacts),
                    cancellation: runtime.cancellation.clone(),
                };
                let fallback_result = handler.fallback(&ctx, Some(error)).await;
                CardOutput::fallback(fallback_result.data, fallback_result.code.unwrap_or_else(|| code.to_string()))
            }
            None => CardOutput::fallback(Value::Object(Default::default()), code),
        };
        output.meta.preserve_empty = !card.internal;
        output.meta.timing.start();
        output.meta.timing.finish();

        runtime
            .artifacts
            .lock()
            .await
            .insert(card.card_type.clone(), output.data.clone());

        self.store
            .finish_card(card.id, CardStatus::Completed, Some(output.clone()), 0, 0)
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;

        self.append(
            runtime,
            Event::unsequenced(
                job.id,
                EventType::CardCompleted,
                Some(card.id),
                serde_json::to_value(&output).unwrap_or(Value::Null),
            ),
        )
        .await?;

        Ok(CardStatus::Completed)
    }

    /// §4.7: `completed` iff every business card completed without
    /// fallback; `partial` iff any business card completed with fallback;
    /// `failed` only when a mandatory card produced no payload at all;
    /// `cancelled` if cancellation was observed.
    fn derive_job_status(&self, _job: &Job, cards: &[Card], cancelled: bool) -> JobStatus {
        if cancelled {
            return JobStatus::Cancelled;
        }
        let business_cards: Vec<&Card> = cards.iter().filter(|c| !c.internal).collect();
        if business_cards
            .iter()
            .any(|c| c.status == CardStatus::Failed)
        {
            return JobStatus::Failed;
        }
        if business_cards.iter().any(|c| {
            c.output
                .as_ref()
                .map(|o| o.is_fallback())
                .unwrap_or(false)
        }) {
            return JobStatus::Partial;
        }
        JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgeted_semaphore_is_reused_across_calls() {
        let mut limits = HashMap::new();
        limits.insert("llm".to_string(), 4);
        let budgets = ConcurrencyBudgets::new(limits);
        let a = budgets.semaphore("llm");
        let b = budgets.semaphore("llm");
        assert_eq!(a.available_permits(), 4);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unconfigured_group_gets_a_very_large_budget() {
        let budgets = ConcurrencyBudgets::new(HashMap::new());
        let sem = budgets.semaphore("resource");
        assert!(sem.available_permits() > 1_000_000);
    }
}
