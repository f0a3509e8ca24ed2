// Scheduler binary entry point: loads the CronJob manifest and runs the
// control loop until Ctrl+C or SIGTERM

use anyhow::Context;
use common::config::Settings;
use common::loader::load_cronjobs;
use common::scheduler::{
    ControllerConfig, CronController, DryRunExecutor, JobExecutor, Scheduler, TriggerEngine,
};
use common::telemetry::{init_logging, init_metrics};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(&settings.observability.log_level)?;
    init_metrics(settings.observability.metrics_port)?;

    info!(
        manifest_path = %settings.scheduler.manifest_path,
        poll_interval_seconds = settings.scheduler.poll_interval_seconds,
        "Starting CronJob scheduler"
    );

    let loaded = load_cronjobs(&settings.scheduler.manifest_path)
        .context("Failed to load CronJob manifest")?;
    for (cronjob, reason) in &loaded.rejected {
        warn!(cronjob = %cronjob, error = %reason, "CronJob skipped");
    }

    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let executor = Arc::new(DryRunExecutor::new(completions_tx)) as Arc<dyn JobExecutor>;

    let controller = Arc::new(CronController::new(
        ControllerConfig {
            poll_interval_seconds: settings.scheduler.poll_interval_seconds,
        },
        TriggerEngine::default(),
        loaded.cronjobs,
        executor,
        completions_rx,
    ));

    let controller_for_shutdown = controller.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        if let Err(e) = controller_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    if let Err(e) = controller.start().await {
        error!(error = %e, "Scheduler error");
        return Err(anyhow::anyhow!("Scheduler error: {}", e));
    }

    info!("Scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
