/// Server setup and initialization
///
/// Wires together all components: log store, listener registry, run tracker,
/// dispatcher, schedule storage, cron scheduler and HTTP routes.

use crate::{
    api::{build_router, AppState},
    config::{Config, ExecutionMode},
    listeners::{BroadcastNotifier, FlowEventKind, ListenerRegistry},
    logs::LogStore,
    project::{EnvSecretResolver, ProjectCatalog},
    runtime::{
        CronSchedulerService, Dispatcher, HttpRemoteExecutor, ProgramRegistry, RunTracker, ScheduleWorkerPool,
    },
    schedule::ScheduleStorage,
};
use anyhow::{Context, Result};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Build the shared application state
///
/// Compiled programs and the project catalog are supplied by the embedder; the
/// coordinator owns everything else.
pub async fn create_state(
    config: &Config,
    programs: Arc<ProgramRegistry>,
    projects: Arc<dyn ProjectCatalog>,
) -> Result<AppState> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.database.data_dir))?;

    tracing::info!("📝 Initializing log store");
    let logs = Arc::new(LogStore::new(&config.logs));
    let listeners = Arc::new(ListenerRegistry::new(config.listeners.ttl()));
    let runs = Arc::new(RunTracker::default());

    let notifier = Arc::new(BroadcastNotifier::new(EVENT_CHANNEL_CAPACITY));
    spawn_event_logger(&notifier);

    tracing::info!("🚀 Initializing dispatcher ({:?} execution)", config.execution.mode);
    let mut dispatcher = Dispatcher::new(
        config.execution.mode,
        Arc::clone(&programs),
        Arc::clone(&runs),
        Arc::clone(&logs),
        Arc::clone(&listeners),
    )
    .with_notifier(notifier)
    .with_secrets(Arc::new(EnvSecretResolver));

    if config.execution.mode == ExecutionMode::Remote {
        tracing::info!("🌐 Remote executor at {}", config.execution.remote_url);
        let remote = HttpRemoteExecutor::new(&config.execution.remote_url, config.execution.remote_timeout())
            .context("Failed to build remote executor client")?;
        dispatcher = dispatcher.with_remote(Arc::new(remote), config.execution.remote_timeout());
    }
    let dispatcher = Arc::new(dispatcher);

    tracing::info!("📋 Initializing schedule storage");
    let db_path = Path::new(&config.database.data_dir).join("schedules.db");
    let storage = ScheduleStorage::connect(&db_path)
        .await
        .with_context(|| format!("Failed to open schedule database {}", db_path.display()))?;

    tracing::info!("⏰ Initializing cron scheduler service");
    let workers = ScheduleWorkerPool::spawn(config.scheduler.workers, Arc::clone(&dispatcher))?;
    let scheduler = Arc::new(
        CronSchedulerService::new(workers, config.scheduler.misfire_grace())
            .await
            .context("Failed to initialize cron scheduler")?
            .with_storage(storage),
    );

    Ok(AppState {
        dispatcher,
        logs,
        listeners,
        runs,
        scheduler,
        projects,
    })
}

/// Create the main Axum application with all routes
///
/// Starts the cron scheduler in the background; published schedules are
/// recovered before its first tick.
pub async fn create_app(
    config: &Config,
    programs: Arc<ProgramRegistry>,
    projects: Arc<dyn ProjectCatalog>,
) -> Result<(Router, AppState)> {
    let state = create_state(config, programs, projects).await?;

    tracing::info!("🚀 Starting cron scheduler");
    let scheduler = Arc::clone(&state.scheduler);
    tokio::spawn(async move {
        if let Err(e) = scheduler.start().await {
            tracing::error!("❌ Failed to start cron scheduler: {:#}", e);
        }
    });

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = build_router(state.clone());

    tracing::info!("✅ Application initialized successfully");
    Ok((app, state))
}

/// Start the HTTP server with the given configuration
///
/// Serves until ctrl-c, then stops the scheduler.
pub async fn start_server(
    config: Config,
    programs: Arc<ProgramRegistry>,
    projects: Arc<dyn ProjectCatalog>,
) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowgate server...");

    let (app, state) = create_app(&config, programs, projects).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down");
    state.scheduler.stop().await?;

    let stats = state.logs.stats();
    tracing::info!("📊 Log store at shutdown: {} keys, {} entries", stats.keys, stats.total_entries);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Trace every run start/end delivered to observers
fn spawn_event_logger(notifier: &BroadcastNotifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    FlowEventKind::RunStart => {
                        tracing::debug!("▶️ Run {} started on {}", event.run_id, event.flow_version_id)
                    }
                    FlowEventKind::RunEnd => {
                        tracing::debug!("⏹️ Run {} ended on {}", event.run_id, event.flow_version_id)
                    }
                },
                Err(RecvError::Lagged(skipped)) => tracing::warn!("⚠️ Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::InMemoryProjectCatalog;
    use crate::schedule::ScheduleJob;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.database.data_dir = dir.join("data").display().to_string();
        config.execution.mode = ExecutionMode::Local;
        config.scheduler.workers = 1;
        config
    }

    #[tokio::test]
    async fn state_persists_published_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let state = create_state(
            &config,
            Arc::new(ProgramRegistry::new()),
            Arc::new(InMemoryProjectCatalog::new()),
        )
        .await
        .unwrap();
        state
            .scheduler
            .publish(ScheduleJob::new("s1", "nightly", "0 3 * * *", "v1"))
            .await
            .unwrap();

        assert!(dir.path().join("data").join("schedules.db").exists());

        let restarted = create_state(
            &config,
            Arc::new(ProgramRegistry::new()),
            Arc::new(InMemoryProjectCatalog::new()),
        )
        .await
        .unwrap();
        assert_eq!(restarted.scheduler.recover_published().await.unwrap(), 1);
        assert_eq!(restarted.scheduler.list_active_jobs().await[0].id, "s1");
    }
}
