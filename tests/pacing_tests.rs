//! Pacing behavior, from the policy in isolation up through paced runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use obj_bench::buffer::MemoryClass;
use obj_bench::config::{CorpusConfig, PacingConfig, RangeConfig, RunConfig, WorkloadKind};
use obj_bench::pacing::{IopsPacer, Pace, Pacer};
use obj_bench::run::Runner;
use obj_bench::store::store_for_uri;

fn paced_config(workload: WorkloadKind, iops: u64) -> RunConfig {
    RunConfig {
        workload,
        target: "mem://".to_string(),
        bucket: "benchdata".to_string(),
        duration: Duration::from_millis(400),
        concurrency: 2,
        object_size: 256,
        corpus: CorpusConfig {
            objects: 6,
            ..CorpusConfig::default()
        },
        range: RangeConfig::default(),
        memory: MemoryClass::Host,
        pacing: Some(PacingConfig {
            iops,
            poisson: false,
        }),
    }
}

/// Exponential inter-arrival sampling produces visibly varied delays, not
/// a lockstep cadence.
#[tokio::test]
async fn test_poisson_delays_vary_between_calls() {
    // Mean 10ms per call for a single worker.
    let pacer = Pacer::new(Arc::new(IopsPacer::new(100, 1, true)));
    let cancel = CancellationToken::new();

    let mut delays = Vec::new();
    for _ in 0..30 {
        let begin = Instant::now();
        assert_eq!(pacer.pace(&cancel).await, Pace::Continue);
        delays.push(begin.elapsed());
    }
    let min = delays.iter().min().unwrap();
    let max = delays.iter().max().unwrap();
    assert!(
        *max > *min + Duration::from_millis(2),
        "exponential delays should spread out: min {:?} max {:?}",
        min,
        max
    );
}

/// Cancellation lands mid-sleep and turns the wait into an immediate stop.
#[tokio::test]
async fn test_cancellation_mid_sleep_returns_stop() {
    // 2 IOPS for one worker: a 500ms interval.
    let pacer = Pacer::new(Arc::new(IopsPacer::new(2, 1, false)));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let begin = Instant::now();
    assert_eq!(pacer.pace(&cancel).await, Pace::Stop);
    assert!(begin.elapsed() < Duration::from_millis(400));
}

/// A paced upload run cannot exceed the configured aggregate rate.
#[tokio::test]
async fn test_paced_run_bounds_op_count() {
    // 40 IOPS over 2 workers: 50ms per worker iteration, ~8 ops each in
    // a 400ms window.
    let config = paced_config(WorkloadKind::Put, 40);
    let store = store_for_uri(&config.target).unwrap();
    let mut runner = Runner::new(config, store);
    let token = CancellationToken::new();

    runner.prepare(&token).await.unwrap();
    let outcome = runner.start(&token).await.unwrap();

    assert!(outcome.error.is_none());
    let total = outcome.operations.len();
    assert!(total >= 2, "paced run still makes progress");
    assert!(total <= 20, "pacing failed to throttle: {} ops", total);
}

/// Preparation uploads consult the same pacer as the measured window.
#[tokio::test]
async fn test_paced_preparation_throttles_uploads() {
    // 6 uploads over 2 prep workers at 50ms per upload: at least ~150ms.
    let config = paced_config(WorkloadKind::Get, 40);
    let store = store_for_uri(&config.target).unwrap();
    let mut runner = Runner::new(config, store);
    let token = CancellationToken::new();

    let begin = Instant::now();
    runner.prepare(&token).await.unwrap();
    let elapsed = begin.elapsed();
    assert!(
        elapsed >= Duration::from_millis(100),
        "preparation ignored pacing: {:?}",
        elapsed
    );
    assert!(elapsed < Duration::from_secs(2));
}
