// src/collector.rs
//! Operation records and the channel that gathers them.
//!
//! Every attempted operation produces exactly one [`Operation`], success or
//! not. Workers hand records to a bounded channel and a single drain task
//! accumulates them; when the channel fills, senders wait rather than drop,
//! so a slow consumer backpressures the run instead of losing data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Queue depth between workers and the drain task.
const RECORD_QUEUE_DEPTH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put,
    Get,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Put => write!(f, "PUT"),
            OpKind::Get => write!(f, "GET"),
        }
    }
}

/// One attempted storage operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub worker: u16,
    pub object: String,
    /// Bytes the operation set out to move.
    pub requested: u64,
    /// Bytes actually moved (or reported stored).
    pub size: u64,
    /// Wall-clock start, for correlating with external logs.
    pub started_at: SystemTime,
    pub start: Instant,
    pub end: Instant,
    pub first_byte: Option<Instant>,
    pub error: Option<String>,
    pub endpoint: String,
}

impl Operation {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// Time to first byte, when the backend surfaced one.
    pub fn ttfb(&self) -> Option<Duration> {
        self.first_byte.map(|fb| fb.saturating_duration_since(self.start))
    }
}

/// The finalized record set for a run.
#[derive(Debug, Default)]
pub struct Operations(Vec<Operation>);

impl Operations {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.0.iter()
    }

    pub fn error_count(&self) -> usize {
        self.0.iter().filter(|op| !op.is_ok()).count()
    }

    pub fn of_kind(&self, kind: OpKind) -> impl Iterator<Item = &Operation> {
        self.0.iter().filter(move |op| op.kind == kind)
    }

    pub fn into_vec(self) -> Vec<Operation> {
        self.0
    }
}

impl From<Vec<Operation>> for Operations {
    fn from(ops: Vec<Operation>) -> Self {
        Self(ops)
    }
}

impl std::ops::Deref for Operations {
    type Target = [Operation];

    fn deref(&self) -> &[Operation] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Operations {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Sending half handed to workers.
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Operation>,
}

impl RecordSender {
    /// Deliver one record, waiting for queue space if necessary.
    pub async fn record(&self, op: Operation) {
        if self.tx.send(op).await.is_err() {
            // Only reachable if close() raced a live worker, which the
            // coordinator prevents by joining workers first.
            warn!("operation record dropped: collector already closed");
        }
    }
}

/// Gathers operation records for one run.
pub struct Collector {
    tx: mpsc::Sender<Operation>,
    drain: JoinHandle<Vec<Operation>>,
}

impl Collector {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<Operation>(RECORD_QUEUE_DEPTH);
        let drain = tokio::spawn(async move {
            let mut ops = Vec::new();
            while let Some(op) = rx.recv().await {
                ops.push(op);
            }
            ops
        });
        Self { tx, drain }
    }

    pub fn sender(&self) -> RecordSender {
        RecordSender { tx: self.tx.clone() }
    }

    /// Stop accepting records and return everything gathered.
    ///
    /// All senders must be dropped (workers joined) before calling, or the
    /// drain waits for them.
    pub async fn close(self) -> Result<Operations> {
        drop(self.tx);
        let ops = self.drain.await.context("record drain task failed")?;
        Ok(Operations(ops))
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Live aggregates shared between workers and termination policies.
#[derive(Debug, Default)]
pub struct RunCounters {
    ops: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl RunCounters {
    pub fn observe(&self, op: &Operation) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(op.size, Ordering::Relaxed);
        if !op.is_ok() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
