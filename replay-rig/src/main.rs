use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use replay_rig::api::{ApiServer, ApiServerConfig, AppState};
use replay_rig::config::{Args, SchedulerConfig};
use replay_rig::control::ControlService;
use replay_rig::diagram::LocalDiagramEngine;
use replay_rig::pipeline::{ExecutionContext, JobStore, JsonFileRepository, QueueRepository};
use replay_rig::plugin::PluginRegistry;
use replay_rig::{logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let directive = logging::filter_directive(&args.log_level, &args.diagram_log_level)?;
    let (logging_config, _log_guard) = logging::init_logging(&args.log_dir, &directive)?;
    panic_hook::install();

    let scheduler = SchedulerConfig::from_args(&args);
    scheduler.validate()?;

    let mut plugins = PluginRegistry::with_builtins();
    if let Some(dir) = &args.plugin_dir {
        plugins = plugins.with_plugin_dir(dir);
    }
    info!(plugins = ?plugins.names(), "Plugins registered");

    let shm_dir = args
        .shm_dir
        .clone()
        .unwrap_or_else(start_flag::default_segment_dir);

    // The diagram engine exists once per process and outlives every job.
    let diagram = Arc::new(LocalDiagramEngine::new());
    let context = Arc::new(ExecutionContext::new(&scheduler, plugins, diagram, shm_dir));

    let repository = args.database.as_ref().map(|path| {
        info!(path = %path.display(), "Persisting job queue");
        Arc::new(JsonFileRepository::new(path)) as Arc<dyn QueueRepository>
    });
    if repository.is_none() {
        warn!("No database configured, the job queue will not be persisted");
    }

    let store = JobStore::new(context, repository);
    store.recover().await;

    let background = CancellationToken::new();
    logging_config.start_retention_cleanup(background.clone());

    let state = AppState::new(ControlService::new(store.clone()))
        .with_logging_config(logging_config);
    let server = ApiServer::new(ApiServerConfig::new(args.address), state);
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    let server_failure = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut server_task => Some(match result {
            Ok(Ok(())) => anyhow::anyhow!("control API stopped unexpectedly"),
            Ok(Err(e)) => anyhow::Error::new(e).context("control API failed"),
            Err(e) => anyhow::Error::new(e).context("control API task failed"),
        }),
    };

    let forced_exit = tokio::spawn(async {
        shutdown_signal().await;
        warn!("Second signal received, exiting immediately");
        std::process::exit(1);
    });

    store.shutdown().await;
    server_token.cancel();
    if server_failure.is_none() {
        match server_task.await {
            Ok(Err(e)) => error!(error = %e, "Control API failed during shutdown"),
            Err(e) => error!(error = %e, "Control API task failed"),
            Ok(Ok(())) => {}
        }
    }
    background.cancel();
    forced_exit.abort();

    match server_failure {
        Some(e) => Err(e),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
