// src/run.rs
//! Run coordination: prepare, the gated start, and cleanup.
//!
//! A run moves through three explicit steps. `prepare` provisions the
//! bucket and, for download runs, the object corpus. `start` spawns the
//! worker tasks, holds them at a shared gate until all are in place, then
//! releases the gate and joins them when the window ends. `cleanup`
//! removes whatever the run itself created and nothing else. Fatal errors
//! land in a first-wins slot; the run still drains every worker before
//! reporting the error, so records and buffer accounting stay consistent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, BufferStats, DeviceAllocator, MemoryClass};
use crate::collector::{Collector, Operations, RunCounters};
use crate::config::{RunConfig, WorkloadKind};
use crate::corpus::{self, DiscoveryPlan, ProgressFn, SynthesisPlan, TestObject};
use crate::pacing::{AutoTermination, IopsPacer, Pacer};
use crate::store::StoreRef;
use crate::worker::{run_worker, RangePolicy, WorkerContext, WorkerMode};

/// Shared first-error slot. The first recorded error wins; later ones are
/// logged at debug and dropped.
#[derive(Default)]
pub struct ErrorSlot {
    slot: Mutex<Option<anyhow::Error>>,
}

impl ErrorSlot {
    pub fn record(&self, err: anyhow::Error) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            debug!("suppressing follow-on error: {:#}", err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn take(&self) -> Option<anyhow::Error> {
        self.slot.lock().take()
    }
}

/// One-shot gate every worker blocks on before its first operation.
///
/// Built on a watch channel so a waiter that subscribes after the release
/// still passes straight through.
pub struct StartGate {
    tx: watch::Sender<bool>,
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }

    pub fn waiter(&self) -> GateWaiter {
        GateWaiter {
            rx: self.tx.subscribe(),
        }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GateWaiter {
    rx: watch::Receiver<bool>,
}

impl GateWaiter {
    pub async fn wait(mut self) {
        // Fails only if the gate was dropped unopened; the run token stops
        // the worker immediately after in that case.
        let _ = self.rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Prepared,
    Finished,
}

/// What the measured window produced.
pub struct RunOutcome {
    pub operations: Operations,
    /// First fatal worker error, if any. Per-operation failures stay on
    /// their records instead.
    pub error: Option<anyhow::Error>,
}

/// Coordinates one benchmark run against one store.
pub struct Runner {
    config: RunConfig,
    store: StoreRef,
    phase: Phase,
    pool: Option<BufferPool>,
    collector: Option<Collector>,
    counters: Arc<RunCounters>,
    errors: Arc<ErrorSlot>,
    corpus: Option<Arc<[TestObject]>>,
    created_prefixes: BTreeSet<String>,
    progress: Option<ProgressFn>,
    device: Option<Arc<dyn DeviceAllocator>>,
    auto: Option<Arc<dyn AutoTermination>>,
}

impl Runner {
    pub fn new(config: RunConfig, store: StoreRef) -> Self {
        Self {
            config,
            store,
            phase: Phase::Idle,
            pool: None,
            collector: None,
            counters: Arc::new(RunCounters::default()),
            errors: Arc::new(ErrorSlot::default()),
            corpus: None,
            created_prefixes: BTreeSet::new(),
            progress: None,
            device: None,
            auto: None,
        }
    }

    /// Callback invoked with the completed fraction during preparation.
    pub fn set_progress(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    /// Allocator backing device-class buffers. Must be set before
    /// `prepare` when the config asks for device memory.
    pub fn set_device_allocator(&mut self, device: Arc<dyn DeviceAllocator>) {
        self.device = Some(device);
    }

    pub fn set_auto_termination(&mut self, policy: Arc<dyn AutoTermination>) {
        self.auto = Some(policy);
    }

    /// Acquire/release totals for the transfer buffer pool, once one
    /// exists.
    pub fn buffer_stats(&self) -> Option<BufferStats> {
        self.pool.as_ref().map(BufferPool::stats)
    }

    fn pacer(&self) -> Pacer {
        match &self.config.pacing {
            Some(p) => Pacer::new(Arc::new(IopsPacer::new(
                p.iops,
                self.config.concurrency,
                p.poisson,
            ))),
            None => Pacer::unlimited(),
        }
    }

    /// Provisions everything the measured window needs. For uploads that
    /// is the bucket; for downloads it is the corpus as well, either
    /// synthesized or discovered. Any failure here is fatal to the run.
    pub async fn prepare(&mut self, token: &CancellationToken) -> Result<()> {
        if self.phase != Phase::Idle {
            bail!("prepare called twice");
        }
        self.config.validate()?;
        if self.config.memory == MemoryClass::Device && self.device.is_none() {
            bail!("device memory requested but no device allocator is configured");
        }

        let pool = BufferPool::new(
            self.config.memory,
            self.config.object_size as usize,
            self.device.clone(),
        );
        let collector = Collector::new();

        match self.config.workload {
            WorkloadKind::Put => {
                self.store
                    .create_bucket(&self.config.bucket)
                    .await
                    .with_context(|| format!("creating bucket {}", self.config.bucket))?;
            }
            WorkloadKind::Get => {
                let cfg = &self.config.corpus;
                if cfg.list_existing {
                    let objects = corpus::discover(
                        DiscoveryPlan {
                            store: Arc::clone(&self.store),
                            bucket: self.config.bucket.clone(),
                            prefix: cfg.prefix.clone(),
                            recursive: !cfg.list_flat,
                            versions: cfg.versions,
                            max_objects: cfg.objects,
                        },
                        token,
                    )
                    .await?;
                    info!("discovered {} objects", objects.len());
                    self.corpus = Some(objects.into());
                } else {
                    let build = corpus::synthesize(
                        SynthesisPlan {
                            store: Arc::clone(&self.store),
                            bucket: self.config.bucket.clone(),
                            count: cfg.objects,
                            versions: cfg.versions,
                            object_size: self.config.object_size,
                            concurrency: self.config.concurrency,
                            pool: pool.clone(),
                            pacer: self.pacer(),
                            sender: collector.sender(),
                            progress: self.progress.clone(),
                        },
                        token,
                    )
                    .await?;
                    self.created_prefixes = build.prefixes;
                    self.corpus = Some(build.objects.into());
                }
            }
        }

        self.pool = Some(pool);
        self.collector = Some(collector);
        self.phase = Phase::Prepared;
        Ok(())
    }

    /// Runs the measured window and returns once every worker has
    /// terminated and all records are drained.
    ///
    /// The window ends at the earliest of the configured duration, a
    /// cancellation of `token`, or an auto-termination policy firing.
    /// In-flight transfers always complete; workers stop initiating new
    /// ones.
    pub async fn start(&mut self, token: &CancellationToken) -> Result<RunOutcome> {
        if self.phase != Phase::Prepared {
            bail!("start called before prepare");
        }
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| anyhow!("start called before prepare"))?;
        let collector = self
            .collector
            .take()
            .ok_or_else(|| anyhow!("start called twice"))?;

        let run_token = match &self.auto {
            Some(policy) => policy.wrap(token, Arc::clone(&self.counters)),
            None => token.child_token(),
        };

        let get_corpus: Option<Arc<[TestObject]>> = match self.config.workload {
            WorkloadKind::Get => Some(
                self.corpus
                    .clone()
                    .ok_or_else(|| anyhow!("no corpus prepared for a download run"))?,
            ),
            WorkloadKind::Put => None,
        };

        let gate = StartGate::new();
        let pacer = self.pacer();
        let mut handles = Vec::with_capacity(self.config.concurrency);
        for index in 0..self.config.concurrency {
            let mode = match &get_corpus {
                Some(objects) => WorkerMode::Get {
                    corpus: Arc::clone(objects),
                    versions: self.config.corpus.versions,
                    range: RangePolicy {
                        enabled: self.config.range.enabled,
                        fixed: self.config.range.size,
                    },
                },
                None => WorkerMode::Put,
            };
            handles.push(tokio::spawn(run_worker(
                gate.waiter(),
                WorkerContext {
                    // In range: validate() caps concurrency at u16::MAX.
                    index: index as u16,
                    mode,
                    store: Arc::clone(&self.store),
                    bucket: self.config.bucket.clone(),
                    object_size: self.config.object_size,
                    pool: pool.clone(),
                    pacer: pacer.clone(),
                    token: run_token.clone(),
                    sender: collector.sender(),
                    counters: Arc::clone(&self.counters),
                    errors: Arc::clone(&self.errors),
                },
            )));
        }

        info!(
            "starting {} workers against {} for {:?}",
            self.config.concurrency,
            self.store.endpoint(),
            self.config.duration
        );
        gate.release();
        let started = Instant::now();

        // The duration is one of the window's terminators, so it is armed
        // here rather than left to the caller.
        let deadline_token = run_token.clone();
        let duration = self.config.duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => deadline_token.cancel(),
                _ = deadline_token.cancelled() => {}
            }
        });

        for handle in handles {
            match handle.await {
                Ok(report) => {
                    self.created_prefixes.extend(report.prefixes);
                }
                Err(err) => {
                    self.errors
                        .record(anyhow::Error::new(err).context("worker task panicked"));
                }
            }
        }
        run_token.cancel();

        let operations = collector.close().await?;
        let stats = pool.stats();
        if stats.acquired != stats.released {
            warn!(
                "buffer accounting mismatch: {} acquired, {} released",
                stats.acquired, stats.released
            );
        }
        info!(
            "run complete: {} operations, {} errors in {:.1}s",
            operations.len(),
            operations.error_count(),
            started.elapsed().as_secs_f64()
        );

        self.phase = Phase::Finished;
        Ok(RunOutcome {
            operations,
            error: self.errors.take(),
        })
    }

    /// Deletes the prefixes this run created. Discovered corpora are left
    /// untouched. Safe to call after a failed run, and idempotent.
    pub async fn cleanup(&mut self) -> Result<()> {
        let prefixes: Vec<String> = std::mem::take(&mut self.created_prefixes)
            .into_iter()
            .collect();
        if prefixes.is_empty() {
            debug!("nothing to clean up");
            return Ok(());
        }
        info!(
            "cleaning up {} prefixes under bucket {}",
            prefixes.len(),
            self.config.bucket
        );
        self.store
            .delete_all(&self.config.bucket, &prefixes)
            .await
            .with_context(|| format!("cleaning up bucket {}", self.config.bucket))
    }
}
