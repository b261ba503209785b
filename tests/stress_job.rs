//! End-to-end jobs against simulated workers
//!
//! Run with: cargo test --test stress_job -- --nocapture

use std::sync::Arc;
use std::time::{Duration, Instant};

use superstep_core::coordination::{self, CoordinationClient, CoordinationPaths, MemoryEnsemble};
use superstep_core::coordinator::BalancerKind;
use superstep_core::local::{LocalCluster, LocalWorkerSettings, WorkerExit};
use superstep_core::runtime::ShutdownSignal;
use superstep_core::storage::{MemoryObjectStore, ObjectStore};
use superstep_core::{JobOutcome, MasterConfig, MasterContext, MasterDriver};

fn job_config(job_id: &str, workers: usize) -> MasterConfig {
    let mut config = MasterConfig::default();
    config.job_id = job_id.into();
    config.health.max_workers = workers;
    config.health.min_workers = workers;
    config.health.poll_period = Duration::from_millis(20);
    config.health.max_poll_attempts = 50;
    config.checkpoint.base_path = format!("checkpoints/{}", job_id);
    config.input.total_vertices = 300;
    config.expected_cleanup_tasks = workers + 1;
    config
}

/// Block until `count` workers registered for the first superstep
async fn await_registrations(ensemble: &MemoryEnsemble, job_id: &str, count: usize) {
    let (session, _events) = ensemble.connect();
    let dir = CoordinationPaths::new(job_id).worker_healthy_dir(0, 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let children = coordination::children_or_empty(&session, &dir, false)
            .await
            .unwrap();
        if children.len() >= count {
            return;
        }
        assert!(Instant::now() < deadline, "only {} workers registered", children.len());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn run_master(
    ensemble: &MemoryEnsemble,
    storage: Arc<dyn ObjectStore>,
    config: MasterConfig,
) -> superstep_core::Result<JobOutcome> {
    let shutdown = ShutdownSignal::new();
    let (session, receiver) = ensemble.connect();
    let ctx = MasterContext::new(config, Arc::new(session), storage);
    ctx.spawn_event_bus(receiver, &shutdown);
    let outcome = tokio::time::timeout(Duration::from_secs(30), MasterDriver::new(ctx).run())
        .await
        .expect("job did not finish in time");
    shutdown.shutdown();
    outcome
}

#[tokio::test]
async fn stress_job_runs_to_completion() {
    let ensemble = MemoryEnsemble::new();
    let storage: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let config = job_config("e2e-complete", 3);
    let cluster = LocalCluster::for_job(&ensemble, storage.clone(), &config, 3, 4);
    await_registrations(&ensemble, &config.job_id, 3).await;

    let start = Instant::now();
    let outcome = run_master(&ensemble, storage.clone(), config.clone())
        .await
        .unwrap();
    println!("Job finished in {:?}: {:?}", start.elapsed(), outcome);
    assert_eq!(
        outcome,
        JobOutcome::Finished {
            supersteps: 5,
            restarts: 0
        }
    );

    for exit in cluster.join().await {
        assert!(matches!(exit.unwrap(), WorkerExit::Finished { .. }));
    }
    let (session, _events) = ensemble.connect();
    let base = CoordinationPaths::new(&config.job_id);
    assert!(!session.exists(base.base(), false).await.unwrap());
    // Checkpoints of supersteps 0, 2 and 4 were finalized and kept
    let finalized = storage
        .list_objects(&format!("{}/", config.checkpoint.base_path))
        .await
        .unwrap()
        .into_iter()
        .filter(|key| key.ends_with(".finalized"))
        .count();
    assert_eq!(finalized, 3);
}

#[tokio::test]
async fn stress_job_restarts_after_worker_crash() {
    let ensemble = MemoryEnsemble::new();
    let storage: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let mut config = job_config("e2e-restart", 3);
    config.health.min_workers = 2;
    config.health.min_percent_responded = 60.0;
    // The crashed worker never leaves a cleaned-up marker
    config.expected_cleanup_tasks = 3;

    let settings = (0..3)
        .map(|p| {
            let mut settings = LocalWorkerSettings::for_job(&config, p, 5);
            if p == 1 {
                settings.crash_at = Some(3);
            }
            settings
        })
        .collect();
    let cluster = LocalCluster::start(&ensemble, storage.clone(), settings);
    await_registrations(&ensemble, &config.job_id, 3).await;

    let outcome = run_master(&ensemble, storage, config).await.unwrap();
    match outcome {
        JobOutcome::Finished {
            supersteps,
            restarts,
        } => {
            assert_eq!(restarts, 1);
            assert_eq!(supersteps, 6);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let exits: Vec<WorkerExit> = cluster
        .join()
        .await
        .into_iter()
        .map(|exit| exit.unwrap())
        .collect();
    assert_eq!(exits[1], WorkerExit::Crashed { superstep: 3 });
    assert!(matches!(exits[0], WorkerExit::Finished { .. }));
    assert!(matches!(exits[2], WorkerExit::Finished { .. }));
}

#[tokio::test]
async fn stress_job_reassigns_lost_ranges() {
    let ensemble = MemoryEnsemble::new();
    let storage: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let mut config = job_config("e2e-reassign", 4);
    config.balancer = BalancerKind::Reassign;
    config.health.min_workers = 3;
    config.health.min_percent_responded = 70.0;
    config.expected_cleanup_tasks = 4;

    let settings = (0..4)
        .map(|p| {
            let mut settings = LocalWorkerSettings::for_job(&config, p, 4);
            if p == 3 {
                settings.crash_at = Some(2);
            }
            settings
        })
        .collect();
    let cluster = LocalCluster::start(&ensemble, storage.clone(), settings);
    await_registrations(&ensemble, &config.job_id, 4).await;

    // node_3's ranges cannot be moved off a dead worker, so the job goes
    // back to the checkpoint of superstep 0 and levels from there
    let outcome = run_master(&ensemble, storage, config).await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Finished {
            supersteps: 5,
            restarts: 1
        }
    );

    let exits: Vec<WorkerExit> = cluster
        .join()
        .await
        .into_iter()
        .map(|exit| exit.unwrap())
        .collect();
    assert_eq!(exits[3], WorkerExit::Crashed { superstep: 2 });
    for exit in &exits[..3] {
        assert!(matches!(exit, WorkerExit::Finished { .. }));
    }
}
