//! # analysis-core
//!
//! The execution engine behind a multi-source person analysis server:
//! job lifecycle and idempotency, card-DAG planning, a concurrency-limited
//! priority-ordered scheduler with timeouts/retries/fallbacks, a durable
//! sequenced event log powering SSE replay, and a cross-job artifact cache
//! with TTL/fingerprinting/stale-while-revalidate.
//!
//! ## Architecture
//!
//! ```text
//! Request API (external, not in this crate)
//!     │
//!     ▼
//! CacheController::before_run ──► cache hit? emit card.prefill, done
//!     │ miss
//!     ▼
//! DagPlanner::plan ──► Vec<PlannedCard> (acyclic, checked)
//!     │
//!     ▼
//! Scheduler::run_job ──► claims ready cards, runs Handler::execute
//!     │                  under a deadline, retries, falls back,
//!     │                  emits events
//!     ▼
//! EventLog::append ──► tailed by SSE fan-out (external), optionally
//!                       woken immediately via WakeBus
//!     │
//!     ▼
//! CacheController::after_run ──► write-through + background refresh
//! ```
//!
//! ## What this crate is not
//!
//! Not a general workflow engine: the card vocabulary per source is a
//! static planning-table declaration, not a dynamically composed graph.
//! Not a transport layer: HTTP/SSE framing, auth, and concrete fetchers or
//! model clients live outside this crate, behind the traits it declares
//! ([`store::JobStore`], [`event_log::EventLog`], [`cache::ArtifactCache`],
//! [`handler::Handler`]).

pub mod artifact;
pub mod bus;
pub mod cache;
pub mod cache_controller;
pub mod card;
pub mod config;
pub mod error;
pub mod event;
pub mod event_log;
pub mod handler;
pub mod job;
pub mod planner;
pub mod refresh_pool;
pub mod scheduler;
pub mod source;
pub mod store;

pub use artifact::{cache_key, content_hash, options_hash, Artifact, IdempotencyRecord, SubjectRun};
pub use bus::WakeBus;
pub use cache::{ArtifactCache, CacheError, CacheHit, RefreshLock};
pub use cache_controller::{content_hash_of, CacheController, CachePolicy};
pub use card::{Card, CardMeta, CardOutput, CardStatus, CardTiming};
pub use config::{AnalysisConfig, ConfigError};
pub use error::{sanitize, AnalysisError, Categorizable, SafeErrorCategory};
pub use event::{Event, EventType};
pub use event_log::{EventLog, EventLogError};
pub use handler::{CardResult, Handler, HandlerContext, HandlerRegistry};
pub use job::{Job, JobStatus, RequestOptions};
pub use planner::{find_cycle, validate_plan, DagPlanner, PlanError, PlannedCard, PlannerRegistry};
pub use refresh_pool::{BackgroundRefreshPool, RefreshRequest, RefreshRunner, RefreshSink};
pub use scheduler::{ConcurrencyBudgets, RunOutcome, Scheduler};
pub use source::Source;
pub use store::{JobStore, StoreError};

pub use async_trait::async_trait;
