//! Postgres-backed implementations of the `analysis-core` storage traits.
//!
//! Every query here is a raw `sqlx::query(...)` call bound at runtime, not
//! the `query!`/`query_as!` compile-time macros — this crate has no live
//! database to validate against at build time, matching the style used by
//! the sibling job-queue crate this workspace descends from.

pub mod artifact_cache;
pub mod event_log;
pub mod job_store;

pub use artifact_cache::{PgArtifactCache, PgRefreshLock};
pub use event_log::PgEventLog;
pub use job_store::PgJobStore;
