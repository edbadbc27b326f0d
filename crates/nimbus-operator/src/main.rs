//! nimbus operator - job worker and health reconciler in one process

use clap::Parser;
use nimbus_common::telemetry::{init_logging, LogConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use nimbus_operator::{Config, Sandbox};

/// Workers given to a `--demo-cluster`
const DEMO_WORKERS: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    init_logging(LogConfig {
        format: config.log_format,
        ..LogConfig::default()
    })?;

    let sandbox = Sandbox::new(config.provisioner(), config.executor())?;
    if let Some(name) = &config.demo_cluster {
        sandbox.seed_demo(&config.queue, name, DEMO_WORKERS).await?;
    }

    let shutdown = CancellationToken::new();

    let reconciler = sandbox.reconciler(config.reconcile_interval());
    let reconciler_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    let worker = sandbox.worker(config.worker());
    let worker_task = tokio::spawn({
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing in-flight jobs");
    shutdown.cancel();

    worker_task.await?;
    reconciler_task.await?;
    worker.wait_idle().await;

    info!("nimbus operator stopped");
    Ok(())
}
