//! Binary entry point: tracing init, config load, pool connect, migrate,
//! serve — following the teacher's `server/src/server/main.rs` shape.

mod worker;

use std::sync::Arc;

use analysis_api::routes;
use analysis_api::state::AppState;
use analysis_api::ApiConfig;
use analysis_core::handler::HandlerRegistry;
use analysis_core::planner::PlannerRegistry;
use analysis_core::WakeBus;
use analysis_postgres::{PgArtifactCache, PgEventLog, PgJobStore, PgRefreshLock};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,analysis_api=debug,sqlx=warn".into()))
        .with(fmt::layer())
        .init();

    let config = ApiConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("../analysis-postgres/migrations").run(&pool).await?;

    // Concrete per-source planners and handlers register here; registries
    // start empty so a freshly-wired binary refuses cleanly (job failed,
    // not a panic) for any source it hasn't been taught yet.
    let planners = Arc::new(PlannerRegistry::new());

    let state = AppState {
        store: Arc::new(PgJobStore::new(pool.clone())),
        log: Arc::new(PgEventLog::new(pool.clone())),
        cache: Arc::new(PgArtifactCache::new(pool.clone())),
        refresh_lock: Arc::new(PgRefreshLock::new(pool)),
        handlers: Arc::new(HandlerRegistry::new()),
        planners: planners.clone(),
        config: Arc::new(config.engine.clone()),
        wake: WakeBus::new(),
        // No concrete pipeline driver is wired in yet, so background-only
        // cards are skipped rather than silently mis-scheduled; see
        // `AppState::refresh_sink`.
        refresh_sink: None,
    };

    tokio::spawn(worker::run_loop(Arc::new(state.clone()), planners));

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "analysis-api listening");
    axum::serve(listener, app).await?;

    Ok(())
}
