// src/worker.rs
//! The per-worker operation loop.
//!
//! One task per configured worker. Each waits at the start gate, acquires
//! its transfer buffer, then loops: check cancellation, consult pacing,
//! plan the next target, run the transfer, emit exactly one record. The
//! transport call itself takes no cancellation token, so a transfer that is
//! already in flight always runs to completion; the loop only stops
//! *initiating* work once the token fires. Per-operation failures land on
//! the record and never stop the loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{BufferPool, TransferBuffer};
use crate::collector::{OpKind, Operation, RecordSender, RunCounters};
use crate::corpus::{object_name, object_prefix, TestObject};
use crate::pacing::{Pace, Pacer};
use crate::run::{ErrorSlot, GateWaiter};
use crate::store::{GetOpts, PutOpts, StoreRef};

/// Range-read policy for GET workers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RangePolicy {
    pub enabled: bool,
    pub fixed: Option<u64>,
}

/// What a worker does each iteration.
pub(crate) enum WorkerMode {
    /// Upload fresh objects named by (worker, counter).
    Put,
    /// Read random corpus entries, optionally ranged and version-pinned.
    Get {
        corpus: Arc<[TestObject]>,
        versions: usize,
        range: RangePolicy,
    },
}

/// Everything one worker owns; moved into its task.
pub(crate) struct WorkerContext {
    pub index: u16,
    pub mode: WorkerMode,
    pub store: StoreRef,
    pub bucket: String,
    pub object_size: u64,
    pub pool: BufferPool,
    pub pacer: Pacer,
    pub token: CancellationToken,
    pub sender: RecordSender,
    pub counters: Arc<RunCounters>,
    pub errors: Arc<ErrorSlot>,
}

/// Per-worker results merged by the coordinator after the join.
#[derive(Debug, Default)]
pub(crate) struct WorkerReport {
    /// Prefixes this worker uploaded under.
    pub prefixes: BTreeSet<String>,
    pub ops: u64,
}

pub(crate) async fn run_worker(gate: GateWaiter, ctx: WorkerContext) -> WorkerReport {
    let mut report = WorkerReport::default();

    gate.wait().await;

    let fill = match ctx.mode {
        WorkerMode::Put => rand::random::<u8>(),
        WorkerMode::Get { .. } => b' ',
    };
    let mut buffer = match ctx.pool.acquire(fill) {
        Ok(buf) => buf,
        Err(err) => {
            ctx.errors
                .record(err.context(format!("allocating buffer for worker {}", ctx.index)));
            return report;
        }
    };

    let mut rng = StdRng::seed_from_u64(ctx.index as u64);
    let endpoint = ctx.store.endpoint();
    let put_opts = PutOpts::default();
    let mut counter: u64 = 1;

    loop {
        if ctx.token.is_cancelled() {
            break;
        }
        if ctx.pacer.pace(&ctx.token).await == Pace::Stop {
            break;
        }

        let op = match &ctx.mode {
            WorkerMode::Put => {
                let op = put_once(&ctx, &buffer, &put_opts, &endpoint, counter).await;
                report.prefixes.insert(object_prefix(ctx.index, counter));
                counter += 1;
                op
            }
            WorkerMode::Get { corpus, versions, range } => {
                get_once(&ctx, corpus, *versions, *range, &mut buffer, &endpoint, &mut rng).await
            }
        };

        ctx.counters.observe(&op);
        ctx.sender.record(op).await;
        report.ops += 1;
    }

    debug!("worker {} stopping after {} ops", ctx.index, report.ops);
    // The buffer drops here: one release on every exit path.
    report
}

async fn put_once(
    ctx: &WorkerContext,
    buffer: &TransferBuffer,
    opts: &PutOpts,
    endpoint: &str,
    counter: u64,
) -> Operation {
    let name = object_name(ctx.index, counter);
    let requested = ctx.object_size;

    let started_at = SystemTime::now();
    let start = Instant::now();
    let res = ctx.store.put(&ctx.bucket, &name, buffer.as_slice(), opts).await;
    let end = Instant::now();

    let (size, error) = match res {
        Ok(result) => {
            if result.size != requested {
                let msg = format!("short upload. want: {}, got: {}", requested, result.size);
                warn!("{}", msg);
                (result.size, Some(msg))
            } else {
                (result.size, None)
            }
        }
        Err(err) => {
            warn!("upload error: {:#}", err);
            (0, Some(format!("{:#}", err)))
        }
    };

    Operation {
        kind: OpKind::Put,
        worker: ctx.index,
        object: name,
        requested,
        size,
        started_at,
        start,
        end,
        first_byte: None,
        error,
        endpoint: endpoint.to_string(),
    }
}

async fn get_once(
    ctx: &WorkerContext,
    corpus: &Arc<[TestObject]>,
    versions: usize,
    range: RangePolicy,
    buffer: &mut TransferBuffer,
    endpoint: &str,
    rng: &mut StdRng,
) -> Operation {
    let obj = &corpus[rng.random_range(0..corpus.len())];

    let mut opts = GetOpts::default();
    let mut requested = obj.size;
    if range.enabled && obj.size > 2 {
        if let Some((start, end)) = pick_range(rng, obj.size, range.fixed) {
            requested = end - start + 1;
            opts.range = Some((start, end));
        }
    }
    if versions > 1 {
        opts.version_id = obj.version_id.clone();
    }

    let started_at = SystemTime::now();
    let start = Instant::now();
    let res = ctx
        .store
        .get(&ctx.bucket, &obj.name, buffer.as_mut_slice(), &opts)
        .await;
    let end = Instant::now();

    let (size, first_byte, error) = match res {
        Ok(n) => {
            // Direct buffer placement surfaces no mid-stream marker, so
            // the first byte lands with the transfer start.
            let err = if n != requested {
                let msg = format!("unexpected download size. want: {}, got: {}", requested, n);
                warn!("{}", msg);
                Some(msg)
            } else {
                None
            };
            (n, Some(start), err)
        }
        Err(err) => {
            warn!("download error: {:#}", err);
            (0, None, Some(format!("{:#}", err)))
        }
    };

    Operation {
        kind: OpKind::Get,
        worker: ctx.index,
        object: obj.name.clone(),
        requested,
        size,
        started_at,
        start,
        end,
        first_byte,
        error,
        endpoint: endpoint.to_string(),
    }
}

/// Choose an inclusive byte range for an object of `size` bytes.
///
/// Fixed lengths place the start uniformly in the window that keeps the
/// whole range inside the object; a fixed length larger than the object
/// yields `None` (whole-object read). Without a fixed length the span is
/// log-uniform and capped so the range stays short of the final byte.
/// Callers gate on `size > 2`.
pub(crate) fn pick_range<R: Rng>(rng: &mut R, size: u64, fixed: Option<u64>) -> Option<(u64, u64)> {
    match fixed {
        Some(len) if len == 0 || len > size => None,
        Some(len) => {
            let start = if size > len { rng.random_range(0..size - len) } else { 0 };
            Some((start, start + len - 1))
        }
        None => {
            let span = rand_span(rng, size - 2);
            let start = rng.random_range(0..=(size - 2 - span));
            Some((start, start + span))
        }
    }
}

/// Log-uniform value in `[1, max]` (0 when `max` is 0), biased small.
fn rand_span<R: Rng>(rng: &mut R, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let hi = (max as f64).log2();
    let exp = rng.random_range(0.0..=hi);
    (2f64.powf(exp).floor() as u64).min(max)
}
