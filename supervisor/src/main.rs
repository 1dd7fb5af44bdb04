use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use supervisor::{
    adapters, api,
    config::Config,
    console::ConsoleState,
    observer::SupervisorObserver,
    persistence,
    reconciler::{self, AgentStatusSource, JsonlSessionArtifacts, SessionArtifacts},
    watchdog, AgentSupervisor, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "supervisor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        backend = ?config.backend,
        binary = %config.agent_binary,
        "supervisor starting"
    );

    // Processes recorded by a previous run cannot be reattached, only reported.
    let recovery = persistence::recover(&config.state_file).await;

    let adapter = adapters::create_adapter(&config);
    let console = Arc::new(ConsoleState::new());
    console.seed_recovered(&recovery);
    let observer: Arc<dyn SupervisorObserver> = console.clone();
    let supervisor = AgentSupervisor::new(adapter, observer, config.supervisor.clone());
    let artifacts: Arc<dyn SessionArtifacts> =
        Arc::new(JsonlSessionArtifacts::new(config.sessions_dir.clone()));

    // Background loops
    tokio::spawn(watchdog::run_watchdog(
        Arc::clone(&supervisor),
        config.supervisor.watchdog_interval,
    ));
    tokio::spawn(persistence::run_persistence_loop(
        Arc::clone(&supervisor),
        config.state_file.clone(),
        config.supervisor.persist_interval,
    ));
    {
        let source: Arc<dyn AgentStatusSource> = console.clone();
        tokio::spawn(reconciler::run_reconciler(
            Arc::clone(&supervisor),
            Arc::clone(&artifacts),
            source,
            config.supervisor.reconcile_interval,
        ));
    }

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        console,
        artifacts,
        recovery,
    });
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping agents");
    supervisor.stop_all().await;
    if let Err(e) = persistence::persist_now(&supervisor, &config.state_file).await {
        error!("failed to persist process state on shutdown: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
