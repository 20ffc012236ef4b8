// src/corpus.rs
//! Corpus preparation: the set of objects a read workload draws from.
//!
//! Two modes. Synthesize uploads a fresh corpus in parallel, one task per
//! configured worker, each pushing from its own transfer buffer; names are
//! deterministic per (worker, counter) so no two tasks can collide and
//! cleanup knows exactly which prefixes this run created. Discover lists
//! objects already in the bucket and never writes anything.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::BufferPool;
use crate::collector::{OpKind, Operation, RecordSender};
use crate::pacing::{Pace, Pacer};
use crate::run::ErrorSlot;
use crate::store::{ListOpts, PutOpts, StoreRef, CONTENT_TYPE};

/// Progress callback fed a monotonic completion fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// One logical object (or object version) in the corpus.
///
/// Read-only once preparation finishes; workers index the frozen corpus
/// without locks.
#[derive(Debug, Clone)]
pub struct TestObject {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    /// Version to pin reads to, when versioned listing is in play.
    pub version_id: Option<String>,
    /// Pending upload payload; cleared once the object is stored.
    pub payload: Option<Bytes>,
}

/// Output of synthesize mode: the corpus plus the prefixes it created.
#[derive(Debug, Default)]
pub struct CorpusBuild {
    pub objects: Vec<TestObject>,
    pub prefixes: BTreeSet<String>,
}

/// Deterministic object name for (worker, counter). Counters start at 1.
pub fn object_name(worker: u16, counter: u64) -> String {
    format!(
        "{}-xx-{}/testobject-obj{}-worker{}.txt",
        counter, worker, counter, worker
    )
}

/// Leading key segment of [`object_name`], tracked for cleanup.
pub fn object_prefix(worker: u16, counter: u64) -> String {
    format!("{}-xx-{}", counter, worker)
}

/// Split `total` objects across `workers` near-evenly; the remainder goes
/// to the first workers.
pub(crate) fn split_counts(total: usize, workers: usize) -> Vec<usize> {
    let workers = workers.max(1);
    let base = total / workers;
    let remainder = total % workers;
    (0..workers)
        .map(|w| base + usize::from(w < remainder))
        .collect()
}

pub struct SynthesisPlan {
    pub store: StoreRef,
    pub bucket: String,
    pub count: usize,
    pub versions: usize,
    pub object_size: u64,
    pub concurrency: usize,
    pub pool: BufferPool,
    pub pacer: Pacer,
    pub sender: RecordSender,
    pub progress: Option<ProgressFn>,
}

/// Upload a fresh corpus.
///
/// The first upload error or size mismatch cancels the remaining work and
/// fails the whole preparation; partial corpora are never returned.
pub async fn synthesize(plan: SynthesisPlan, token: &CancellationToken) -> Result<CorpusBuild> {
    let SynthesisPlan {
        store,
        bucket,
        count,
        versions,
        object_size,
        concurrency,
        pool,
        pacer,
        sender,
        progress,
    } = plan;

    store
        .create_bucket(&bucket)
        .await
        .with_context(|| format!("creating bucket {}", bucket))?;
    if versions > 1 {
        store
            .enable_versioning(&bucket)
            .await
            .with_context(|| format!("enabling versioning on bucket {}", bucket))?;
        info!("uploading {} objects with {} versions each", count, versions);
    } else {
        info!("uploading {} objects", count);
    }

    let total = count * versions;
    let build = Arc::new(Mutex::new(CorpusBuild::default()));
    let errors = Arc::new(ErrorSlot::default());
    // Child token: the first failing task cancels its siblings without
    // touching the run token.
    let prep_token = token.child_token();

    let mut tasks = Vec::new();
    for (worker, chunk) in split_counts(count, concurrency).into_iter().enumerate() {
        if chunk == 0 {
            continue;
        }
        tasks.push(tokio::spawn(upload_chunk(UploadTask {
            worker: worker as u16,
            chunk,
            versions,
            object_size,
            total,
            store: Arc::clone(&store),
            bucket: bucket.clone(),
            pool: pool.clone(),
            pacer: pacer.clone(),
            token: prep_token.clone(),
            sender: sender.clone(),
            build: Arc::clone(&build),
            errors: Arc::clone(&errors),
            progress: progress.clone(),
        })));
    }
    for task in tasks {
        task.await.context("prepare task panicked")?;
    }

    if let Some(err) = errors.take() {
        return Err(err);
    }
    let build = std::mem::take(&mut *build.lock());
    if build.objects.len() < total {
        bail!(
            "preparation interrupted after {} of {} uploads",
            build.objects.len(),
            total
        );
    }
    Ok(build)
}

struct UploadTask {
    worker: u16,
    chunk: usize,
    versions: usize,
    object_size: u64,
    total: usize,
    store: StoreRef,
    bucket: String,
    pool: BufferPool,
    pacer: Pacer,
    token: CancellationToken,
    sender: RecordSender,
    build: Arc<Mutex<CorpusBuild>>,
    errors: Arc<ErrorSlot>,
    progress: Option<ProgressFn>,
}

async fn upload_chunk(task: UploadTask) {
    let buffer = match task.pool.acquire(rand::random::<u8>()) {
        Ok(buf) => buf,
        Err(err) => {
            task.errors.record(err.context("allocating prepare buffer"));
            task.token.cancel();
            return;
        }
    };
    // The payload handle every pending entry carries; identical to the
    // buffer contents the upload actually pushes.
    let payload = Bytes::copy_from_slice(buffer.as_slice());
    let endpoint = task.store.endpoint();
    let put_opts = PutOpts::default();

    for counter in 1..=(task.chunk as u64) {
        if task.token.is_cancelled() {
            return;
        }
        if task.pacer.pace(&task.token).await == Pace::Stop {
            return;
        }
        let name = object_name(task.worker, counter);
        let prefix = object_prefix(task.worker, counter);
        for _ in 0..task.versions {
            if task.token.is_cancelled() {
                return;
            }
            let mut obj = TestObject {
                name: name.clone(),
                size: task.object_size,
                content_type: put_opts.content_type.clone(),
                version_id: None,
                payload: Some(payload.clone()),
            };

            let started_at = SystemTime::now();
            let start = Instant::now();
            let res = task
                .store
                .put(&task.bucket, &name, buffer.as_slice(), &put_opts)
                .await;
            let end = Instant::now();

            let result = match res {
                Ok(r) => r,
                Err(err) => {
                    task.errors.record(err.context("upload error"));
                    task.token.cancel();
                    return;
                }
            };
            if result.size != task.object_size {
                task.errors.record(anyhow!(
                    "short upload. want: {}, got: {}",
                    task.object_size,
                    result.size
                ));
                task.token.cancel();
                return;
            }

            obj.version_id = result.version_id;
            obj.payload = None;
            {
                let mut build = task.build.lock();
                build.objects.push(obj);
                build.prefixes.insert(prefix.clone());
                // Called under the lock so fractions arrive in order.
                if let Some(cb) = &task.progress {
                    cb(build.objects.len() as f64 / task.total as f64);
                }
            }
            task.sender
                .record(Operation {
                    kind: OpKind::Put,
                    worker: task.worker,
                    object: name.clone(),
                    requested: task.object_size,
                    size: result.size,
                    started_at,
                    start,
                    end,
                    first_byte: None,
                    error: None,
                    endpoint: endpoint.clone(),
                })
                .await;
        }
    }
    debug!("prepare worker {} finished {} objects", task.worker, task.chunk);
}

pub struct DiscoveryPlan {
    pub store: StoreRef,
    pub bucket: String,
    pub prefix: String,
    pub recursive: bool,
    pub versions: usize,
    /// Stop after this many entries; 0 means no cap.
    pub max_objects: usize,
}

/// Build the corpus from objects already in the bucket.
///
/// Zero-byte objects are skipped. With `versions > 1`, entries without a
/// version id are skipped and at most `versions` entries are retained per
/// key. An empty result is a fatal precondition failure.
pub async fn discover(plan: DiscoveryPlan, token: &CancellationToken) -> Result<Vec<TestObject>> {
    let DiscoveryPlan { store, bucket, prefix, recursive, versions, max_objects } = plan;

    let found = store
        .bucket_exists(&bucket)
        .await
        .with_context(|| format!("checking bucket {}", bucket))?;
    if !found {
        bail!("bucket {} does not exist and list_existing is set", bucket);
    }

    let mut objects = Vec::new();
    let mut versions_per_key: HashMap<String, usize> = HashMap::new();
    let opts = ListOpts {
        prefix: prefix.clone(),
        recursive,
        with_versions: versions > 1,
    };
    let mut listing = store.list(&bucket, opts);
    while let Some(entry) = listing.next().await {
        if token.is_cancelled() {
            bail!("discovery cancelled");
        }
        let entry = entry.context("listing failed")?;
        if entry.size == 0 {
            continue;
        }

        let mut version_id = None;
        if versions > 1 {
            let id = match entry.version_id.filter(|v| !v.is_empty()) {
                Some(id) => id,
                None => continue,
            };
            let seen = versions_per_key.entry(entry.key.clone()).or_insert(0);
            if *seen >= versions {
                continue;
            }
            *seen += 1;
            version_id = Some(id);
        }

        objects.push(TestObject {
            name: entry.key,
            size: entry.size,
            content_type: CONTENT_TYPE.to_string(),
            version_id,
            payload: None,
        });
        if max_objects > 0 && objects.len() >= max_objects {
            break;
        }
    }

    if objects.is_empty() {
        bail!("no objects found for bucket {}", bucket);
    }
    info!("discovered {} objects in bucket {}", objects.len(), bucket);
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic_and_collision_free() {
        assert_eq!(object_name(0, 1), "1-xx-0/testobject-obj1-worker0.txt");
        assert_eq!(object_name(3, 12), "12-xx-3/testobject-obj12-worker3.txt");
        assert_eq!(object_prefix(3, 12), "12-xx-3");
        assert!(object_name(3, 12).starts_with(&object_prefix(3, 12)));

        let mut seen = std::collections::HashSet::new();
        for worker in 0..4u16 {
            for counter in 1..=50u64 {
                assert!(seen.insert(object_name(worker, counter)));
            }
        }
    }

    #[test]
    fn split_is_near_even_and_exhaustive() {
        assert_eq!(split_counts(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_counts(10, 3), vec![4, 3, 3]);
        assert_eq!(split_counts(4, 8), vec![1, 1, 1, 1, 0, 0, 0, 0]);
        assert_eq!(split_counts(0, 3), vec![0, 0, 0]);
        for (total, workers) in [(2500, 20), (7, 3), (1, 5)] {
            let counts = split_counts(total, workers);
            assert_eq!(counts.iter().sum::<usize>(), total);
            assert_eq!(counts.len(), workers);
        }
    }
}
