// src/pacing.rs
//! Operation pacing and early-termination seams.
//!
//! Workers consult a [`PacingPolicy`] once per loop iteration, before
//! planning the next operation. The policy may sleep to shape the issue
//! rate; the wait is cancellation-aware so a paced worker still shuts down
//! promptly. The decision algorithms themselves are pluggable; the built-in
//! [`IopsPacer`] throttles to a fixed aggregate rate with optional Poisson
//! arrival jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::collector::RunCounters;

/// Per-iteration verdict from a pacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Issue the next operation.
    Continue,
    /// Stop the worker loop cleanly.
    Stop,
}

/// Decides when the next operation may start.
#[async_trait]
pub trait PacingPolicy: Send + Sync {
    /// Wait until the next operation should be issued.
    ///
    /// Implementations must return [`Pace::Stop`] promptly once `cancel`
    /// fires instead of finishing their wait.
    async fn pace(&self, cancel: &CancellationToken) -> Pace;
}

/// Optional pacing handle shared by all workers of a run.
///
/// When no policy is configured every call is a free `Continue`.
#[derive(Clone, Default)]
pub struct Pacer {
    policy: Option<Arc<dyn PacingPolicy>>,
}

impl Pacer {
    pub fn unlimited() -> Self {
        Self { policy: None }
    }

    pub fn new(policy: Arc<dyn PacingPolicy>) -> Self {
        Self { policy: Some(policy) }
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    pub async fn pace(&self, cancel: &CancellationToken) -> Pace {
        match &self.policy {
            None => Pace::Continue,
            Some(policy) => policy.pace(cancel).await,
        }
    }
}

/// Throttles operation starts to a fixed aggregate IOPS target.
///
/// The target is split evenly across the worker pool; each call waits one
/// per-worker inter-arrival interval. With `poisson` set, intervals are
/// sampled from an exponential distribution with the same mean, which
/// models open-loop arrivals instead of a lockstep cadence.
pub struct IopsPacer {
    interval: Duration,
    jitter: Option<Exp<f64>>,
    rng: Mutex<StdRng>,
}

impl IopsPacer {
    pub fn new(iops: u64, workers: usize, poisson: bool) -> Self {
        let workers = workers.max(1) as f64;
        let mean_micros = if iops == 0 {
            0.0
        } else {
            1_000_000.0 / (iops as f64 / workers)
        };
        let jitter = if poisson && mean_micros > 0.0 {
            // Exp::new only fails for non-positive lambda.
            Exp::new(1.0 / mean_micros).ok()
        } else {
            None
        };
        Self {
            interval: Duration::from_micros(mean_micros as u64),
            jitter,
            rng: Mutex::new(StdRng::seed_from_u64(rand::random())),
        }
    }

    /// Mean per-worker inter-arrival interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl PacingPolicy for IopsPacer {
    async fn pace(&self, cancel: &CancellationToken) -> Pace {
        let delay = match &self.jitter {
            Some(exp) => {
                let micros = exp.sample(&mut *self.rng.lock().await);
                Duration::from_micros(micros as u64)
            }
            None => self.interval,
        };
        if delay.is_zero() {
            return Pace::Continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => Pace::Stop,
            _ = tokio::time::sleep(delay) => Pace::Continue,
        }
    }
}

/// Early-stop seam for policies that watch live run aggregates.
///
/// The coordinator hands the run token and shared counters to the policy,
/// which returns the token workers actually watch. A policy typically
/// derives a child token and cancels it once its condition is met; the
/// parent firing always propagates to the child.
pub trait AutoTermination: Send + Sync {
    fn wrap(&self, parent: &CancellationToken, counters: Arc<RunCounters>) -> CancellationToken;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn interval_splits_target_across_workers() {
        // 1000 IOPS over 10 workers: 100 ops/s each, 10ms apart.
        let pacer = IopsPacer::new(1000, 10, false);
        assert_eq!(pacer.interval(), Duration::from_millis(10));
        assert!(pacer.jitter.is_none());

        let pacer = IopsPacer::new(1000, 10, true);
        assert!(pacer.jitter.is_some());
    }

    #[test]
    fn zero_target_means_no_throttle() {
        let pacer = IopsPacer::new(0, 4, true);
        assert_eq!(pacer.interval(), Duration::ZERO);
        assert!(pacer.jitter.is_none());
    }

    #[tokio::test]
    async fn unlimited_pacer_never_waits() {
        let pacer = Pacer::unlimited();
        let cancel = CancellationToken::new();
        let begin = Instant::now();
        for _ in 0..1000 {
            assert_eq!(pacer.pace(&cancel).await, Pace::Continue);
        }
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancellation_cuts_the_wait_short() {
        let pacer = Pacer::new(Arc::new(IopsPacer::new(1, 1, false)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let begin = Instant::now();
        assert_eq!(pacer.pace(&cancel).await, Pace::Stop);
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn paced_iterations_respect_the_interval() {
        let pacer = Pacer::new(Arc::new(IopsPacer::new(100, 1, false)));
        let cancel = CancellationToken::new();
        let begin = Instant::now();
        for _ in 0..3 {
            assert_eq!(pacer.pace(&cancel).await, Pace::Continue);
        }
        // Three 10ms waits, with generous slack for CI timers.
        assert!(begin.elapsed() >= Duration::from_millis(25));
    }
}
