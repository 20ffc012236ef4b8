//! Corpus preparation behavior: parallel synthesis and discovery.
//!
//! Exercises `synthesize` and `discover` directly against the in-memory
//! backend: deterministic layout, version handling, progress reporting,
//! first-error abort, and the discovery filters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use obj_bench::buffer::{BufferPool, MemoryClass};
use obj_bench::collector::Collector;
use obj_bench::corpus::{
    discover, object_name, object_prefix, synthesize, DiscoveryPlan, SynthesisPlan,
};
use obj_bench::pacing::Pacer;
use obj_bench::store::mem::MemStore;
use obj_bench::store::{
    GetOpts, ListEntry, ListOpts, ObjectStore, PutOpts, PutResult, StoreRef,
};
use obj_bench::OpKind;

const BUCKET: &str = "benchdata";

fn plan(store: StoreRef, count: usize, versions: usize, concurrency: usize) -> SynthesisPlan {
    let object_size = 512u64;
    SynthesisPlan {
        store,
        bucket: BUCKET.to_string(),
        count,
        versions,
        object_size,
        concurrency,
        pool: BufferPool::new(MemoryClass::Host, object_size as usize, None),
        pacer: Pacer::unlimited(),
        sender: Collector::new().sender(),
        progress: None,
    }
}

/// Ten objects over three uploaders split 4/3/3, named by (counter, worker)
/// with counters starting at 1.
#[tokio::test]
async fn test_synthesize_layout_matches_worker_split() {
    let mem = Arc::new(MemStore::new());
    let collector = Collector::new();
    let mut plan = plan(mem.clone(), 10, 1, 3);
    plan.sender = collector.sender();
    let pool = plan.pool.clone();

    let build = synthesize(plan, &CancellationToken::new()).await.unwrap();

    let mut expected_names = Vec::new();
    let mut expected_prefixes = Vec::new();
    for (worker, chunk) in [(0u16, 4u64), (1, 3), (2, 3)] {
        for counter in 1..=chunk {
            expected_names.push(object_name(worker, counter));
            expected_prefixes.push(object_prefix(worker, counter));
        }
    }

    let mut names: Vec<String> = build.objects.iter().map(|o| o.name.clone()).collect();
    names.sort();
    expected_names.sort();
    assert_eq!(names, expected_names);

    let mut prefixes: Vec<String> = build.prefixes.iter().cloned().collect();
    prefixes.sort();
    expected_prefixes.sort();
    assert_eq!(prefixes, expected_prefixes);

    assert_eq!(mem.object_count(BUCKET), 10);
    assert!(build.objects.iter().all(|o| o.size == 512 && o.payload.is_none()));

    let stats = pool.stats();
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.released, 3);

    let records = collector.close().await.unwrap();
    assert_eq!(records.len(), 10);
    assert!(records.iter().all(|op| op.kind == OpKind::Put && op.is_ok()));
}

/// With versions > 1 the bucket is made versioned and every version gets
/// its own corpus entry carrying a distinct version id.
#[tokio::test]
async fn test_synthesize_versions_get_distinct_ids() {
    let mem = Arc::new(MemStore::new());
    let build = synthesize(plan(mem.clone(), 2, 3, 2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(build.objects.len(), 6);
    assert_eq!(mem.object_count(BUCKET), 2);
    for key in mem.keys(BUCKET) {
        assert_eq!(mem.version_count(BUCKET, &key), 3);
        let mut ids: Vec<&str> = build
            .objects
            .iter()
            .filter(|o| o.name == key)
            .map(|o| o.version_id.as_deref().expect("versioned entry without id"))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3, "version ids must be distinct per key");
    }
}

/// Progress fractions arrive in non-decreasing order and finish at 1.0.
#[tokio::test]
async fn test_synthesize_progress_is_monotonic() {
    let mem = Arc::new(MemStore::new());
    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut plan = plan(mem, 6, 1, 2);
    plan.progress = Some(Arc::new(move |fraction| {
        sink.lock().unwrap().push(fraction);
    }));
    synthesize(plan, &CancellationToken::new()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "fractions went backwards: {seen:?}");
    assert!((seen.last().unwrap() - 1.0).abs() < 1e-9);
}

/// The first upload failure aborts the sibling uploaders and fails the
/// whole preparation; no partial corpus is returned.
#[tokio::test]
async fn test_synthesize_first_failure_aborts_preparation() {
    let flaky = Arc::new(FlakyStore {
        inner: MemStore::new(),
        puts: AtomicU64::new(0),
        fail_after: 3,
    });
    let err = synthesize(plan(flaky.clone(), 20, 1, 2), &CancellationToken::new())
        .await
        .unwrap_err();

    let chain = format!("{err:#}");
    assert!(chain.contains("upload error"), "{chain}");
    assert!(chain.contains("injected put failure"), "{chain}");
    assert!(flaky.inner.object_count(BUCKET) < 20);
}

/// A pre-cancelled token yields an interrupted preparation, not a partial
/// corpus.
#[tokio::test]
async fn test_synthesize_cancellation_is_interruption() {
    let token = CancellationToken::new();
    token.cancel();
    let err = synthesize(plan(Arc::new(MemStore::new()), 10, 1, 2), &token)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("preparation interrupted"),
        "{err:#}"
    );
}

/// Versioned discovery keeps at most `versions` entries per key, newest
/// first, and honors the global object cap.
#[tokio::test]
async fn test_discover_caps_versions_per_key_and_total() {
    let mem = Arc::new(MemStore::new());
    let store: StoreRef = mem.clone();
    store.create_bucket(BUCKET).await.unwrap();
    store.enable_versioning(BUCKET).await.unwrap();

    let opts = PutOpts::default();
    let mut ids: Vec<(String, String)> = Vec::new();
    for key in ["a.bin", "b.bin"] {
        for _ in 0..3 {
            let result = store.put(BUCKET, key, &[1u8; 64], &opts).await.unwrap();
            ids.push((key.to_string(), result.version_id.unwrap()));
        }
    }

    let discovery = |max_objects| DiscoveryPlan {
        store: Arc::clone(&store),
        bucket: BUCKET.to_string(),
        prefix: String::new(),
        recursive: true,
        versions: 2,
        max_objects,
    };

    let capped = discover(discovery(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(capped.len(), 3);
    let names: Vec<&str> = capped.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["a.bin", "a.bin", "b.bin"]);
    // Newest two versions of "a.bin" come first.
    let a_newest: Vec<&str> = ids
        .iter()
        .filter(|(k, _)| k == "a.bin")
        .rev()
        .take(2)
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(capped[0].version_id.as_deref(), Some(a_newest[0]));
    assert_eq!(capped[1].version_id.as_deref(), Some(a_newest[1]));

    let uncapped = discover(discovery(0), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(uncapped.len(), 4, "two versions retained per key");
}

/// Zero-byte objects are skipped, the prefix restricts the listing, and a
/// flat listing ignores nested keys.
#[tokio::test]
async fn test_discover_skips_empty_and_out_of_prefix_objects() {
    let mem = Arc::new(MemStore::new());
    let store: StoreRef = mem.clone();
    store.create_bucket(BUCKET).await.unwrap();
    let opts = PutOpts::default();
    store.put(BUCKET, "logs/x", &[1u8; 64], &opts).await.unwrap();
    store.put(BUCKET, "logs/y", &[], &opts).await.unwrap();
    store.put(BUCKET, "data/z", &[1u8; 64], &opts).await.unwrap();
    store.put(BUCKET, "top.bin", &[1u8; 64], &opts).await.unwrap();

    let discovery = |prefix: &str, recursive| DiscoveryPlan {
        store: Arc::clone(&store),
        bucket: BUCKET.to_string(),
        prefix: prefix.to_string(),
        recursive,
        versions: 1,
        max_objects: 0,
    };

    let logs = discover(discovery("logs/", true), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].name, "logs/x");

    let flat = discover(discovery("", false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(flat.len(), 1);
    assert_eq!(flat[0].name, "top.bin");
}

/// Cancelling mid-listing fails discovery instead of returning a partial
/// corpus.
#[tokio::test]
async fn test_discover_cancellation_fails_the_listing() {
    let mem = Arc::new(MemStore::new());
    let store: StoreRef = mem.clone();
    store.create_bucket(BUCKET).await.unwrap();
    store
        .put(BUCKET, "one.bin", &[1u8; 64], &PutOpts::default())
        .await
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = discover(
        DiscoveryPlan {
            store,
            bucket: BUCKET.to_string(),
            prefix: String::new(),
            recursive: true,
            versions: 1,
            max_objects: 0,
        },
        &token,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("discovery cancelled"), "{err:#}");
}

/// The naming scheme is a stable contract: counter then worker, prefix as
/// the first path segment.
#[test]
fn test_object_names_follow_counter_worker_scheme() {
    assert_eq!(object_name(0, 1), "1-xx-0/testobject-obj1-worker0.txt");
    assert_eq!(object_name(7, 3), "3-xx-7/testobject-obj3-worker7.txt");
    assert_eq!(object_prefix(7, 3), "3-xx-7");
    assert!(object_name(7, 3).starts_with(&format!("{}/", object_prefix(7, 3))));
}

/// Delegates to the in-memory store, failing puts after `fail_after`
/// successes.
struct FlakyStore {
    inner: MemStore,
    puts: AtomicU64,
    fail_after: u64,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn bucket_exists(&self, bucket: &str) -> anyhow::Result<bool> {
        self.inner.bucket_exists(bucket).await
    }

    async fn create_bucket(&self, bucket: &str) -> anyhow::Result<()> {
        self.inner.create_bucket(bucket).await
    }

    async fn enable_versioning(&self, bucket: &str) -> anyhow::Result<()> {
        self.inner.enable_versioning(bucket).await
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        opts: &PutOpts,
    ) -> anyhow::Result<PutResult> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            anyhow::bail!("injected put failure");
        }
        self.inner.put(bucket, key, data, opts).await
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        buf: &mut [u8],
        opts: &GetOpts,
    ) -> anyhow::Result<u64> {
        self.inner.get(bucket, key, buf, opts).await
    }

    fn list<'a>(&'a self, bucket: &'a str, opts: ListOpts) -> BoxStream<'a, anyhow::Result<ListEntry>> {
        self.inner.list(bucket, opts)
    }

    async fn delete_all(&self, bucket: &str, prefixes: &[String]) -> anyhow::Result<()> {
        self.inner.delete_all(bucket, prefixes).await
    }
}
