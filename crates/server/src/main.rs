//! feedsync-server: scheduled sync engine with its admin and read API.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use feedsync_engine::transform::TransformLimits;
use feedsync_engine::{
    EngineSettings, HttpFetcher, MemoryStore, PgSyncStore, ScheduleCalculator, SyncScheduler,
    SyncService, SyncStore, Transformer,
};
use feedsync_server::router::build_router;
use feedsync_server::state::AppState;
use feedsync_server::db;

// ── CLI ─────────────────────────────────────────────────────────────

/// Scheduled data-synchronization engine.
#[derive(Parser, Debug)]
#[command(name = "feedsync-server", version, about)]
struct Cli {
    /// Config profile (overrides FEEDSYNC_PROFILE).
    #[arg(long, env = "FEEDSYNC_PROFILE")]
    profile: Option<String>,

    /// Serve the API only; do not dispatch scheduled runs.
    #[arg(long)]
    no_scheduler: bool,

    /// Keep all state in memory, even if PostgreSQL is configured.
    #[arg(long)]
    memory_store: bool,
}

fn load_config(cli: &Cli) -> feedsync_core::Config {
    feedsync_core::config::load_dotenv();
    match &cli.profile {
        Some(profile) => feedsync_core::Config::for_profile(profile),
        None => feedsync_core::Config::from_env(),
    }
}

async fn build_store(
    config: &feedsync_core::Config,
    memory_only: bool,
) -> (Arc<dyn SyncStore>, &'static str) {
    let history_cap = config.retention.history_cap;
    if !memory_only {
        if let Some(pool) = db::init_pg_pool(&config.postgres).await {
            return (Arc::new(PgSyncStore::new(pool, history_cap)), "postgres");
        }
        warn!("Falling back to in-memory store: definitions and history are lost on restart");
    }
    (Arc::new(MemoryStore::new(history_cap)), "memory")
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        // Hold the sender; dropping it would stop the server.
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    let _ = tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);
    config.validate()?;
    config.log_summary();
    if !config.lease_covers_run_budget() {
        warn!(
            "SYNC_LEASE_TTL_SECS={} does not cover fetch + transform budgets; \
             a slow run may lose its lease to another instance",
            config.scheduler.lease_ttl_secs
        );
    }

    let (store, backend) = build_store(&config, cli.memory_store).await;
    let fetcher = Arc::new(HttpFetcher::from_config(&config.fetch)?);
    let service = SyncService::new(
        store,
        fetcher,
        Transformer::new(TransformLimits::from_config(&config.transform)),
        ScheduleCalculator::default(),
        EngineSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if cli.no_scheduler {
        info!("Scheduler disabled (--no-scheduler)");
        None
    } else {
        Some(Arc::new(SyncScheduler::from_config(
            service.clone(),
            &config.scheduler,
        )))
    };
    let scheduler_task = scheduler.clone().map(|scheduler| {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    });

    let state = Arc::new(AppState::new(service, scheduler, backend));
    let app = build_router(state, &config.server.cors_origin);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    tokio::spawn(shutdown_signal(shutdown_tx));

    let mut server_rx = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    if let Some(task) = scheduler_task {
        task.await?;
    }
    info!("Server stopped");
    Ok(())
}
