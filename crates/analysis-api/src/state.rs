//! [`AppState`]: the shared handle every route closes over, following the
//! teacher's `AppState`-via-`Arc` convention.

use std::sync::Arc;

use analysis_core::cache::ArtifactCache;
use analysis_core::event_log::EventLog;
use analysis_core::handler::HandlerRegistry;
use analysis_core::planner::PlannerRegistry;
use analysis_core::refresh_pool::RefreshSink;
use analysis_core::store::JobStore;
use analysis_core::{AnalysisConfig, CacheController, RefreshLock, WakeBus};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub log: Arc<dyn EventLog>,
    pub cache: Arc<dyn ArtifactCache>,
    pub refresh_lock: Arc<dyn RefreshLock>,
    pub handlers: Arc<HandlerRegistry>,
    pub planners: Arc<PlannerRegistry>,
    pub config: Arc<AnalysisConfig>,
    pub wake: WakeBus,
    /// `None` until a binary wires a [`BackgroundRefreshPool`](analysis_core::refresh_pool::BackgroundRefreshPool)
    /// together with a concrete [`RefreshRunner`](analysis_core::refresh_pool::RefreshRunner); background-only
    /// cards are skipped (not scheduled inline) either way.
    pub refresh_sink: Option<Arc<dyn RefreshSink>>,
}

impl AppState {
    pub fn cache_controller(&self) -> CacheController {
        CacheController::new(
            self.cache.clone(),
            self.refresh_lock.clone(),
            self.log.clone(),
            self.config.clone(),
        )
    }
}
