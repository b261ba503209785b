//! Master demo binary
//!
//! Runs a master against an in-process ensemble with simulated workers.

use std::path::PathBuf;
use std::sync::Arc;

use superstep_core::coordination::MemoryEnsemble;
use superstep_core::local::LocalCluster;
use superstep_core::runtime::ShutdownSignal;
use superstep_core::storage::open_store;
use superstep_core::{metrics, MasterConfig, MasterContext, MasterDriver};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = MasterConfig::load(path.as_deref())?;
    let halt_after: u64 = std::env::var("BSP_HALT_AFTER")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let workers = config.health.max_workers;
    // Every worker leaves a cleaned-up marker next to the master's
    config.expected_cleanup_tasks = workers + 1;
    info!(
        "Starting master for job {} with {} local workers",
        config.job_id, workers
    );

    let storage = open_store(&config.storage).await?;
    let ensemble = MemoryEnsemble::new();
    let shutdown = ShutdownSignal::new();
    let cluster = LocalCluster::for_job(
        &ensemble,
        storage.clone(),
        &config,
        workers as u32,
        halt_after,
    );

    let (session, receiver) = ensemble.connect();
    let ctx = MasterContext::new(config, Arc::new(session), storage);
    let bus = ctx.spawn_event_bus(receiver, &shutdown);

    let outcome = MasterDriver::new(ctx).run().await;
    for exit in cluster.join().await {
        match exit {
            Ok(exit) => info!("Worker exited: {:?}", exit),
            Err(e) => error!("Worker failed: {}", e),
        }
    }
    shutdown.shutdown();
    let _ = bus.await;

    print!("{}", metrics::gather());
    match outcome {
        Ok(outcome) => {
            info!("Job outcome: {:?}", outcome);
            Ok(())
        }
        Err(e) => {
            error!("Job failed: {}", e);
            Err(e.into())
        }
    }
}
