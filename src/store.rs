// src/store.rs
//! Object storage transport abstraction.
//!
//! The engine drives any backend that implements [`ObjectStore`]; the wire
//! protocol lives on the other side of this trait. Two reference backends
//! ship in-tree: an in-memory versioned store (`mem://`, also the test
//! fixture) and a local-filesystem store (`file:///path`). Production
//! transports (S3 and friends) are provided by embedders.
//!
//! Transfer methods deliberately take no cancellation token: once a PUT or
//! GET has started it runs to completion, and callers cancel between
//! operations instead (see the worker loop).

pub mod fs;
pub mod mem;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Default content type attached to synthesized objects.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Options for a single PUT.
#[derive(Debug, Clone)]
pub struct PutOpts {
    pub content_type: String,
}

impl Default for PutOpts {
    fn default() -> Self {
        Self { content_type: CONTENT_TYPE.to_string() }
    }
}

/// What the backend reports after a PUT.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Bytes the backend claims to have stored.
    pub size: u64,
    /// Version id assigned by the backend, if the bucket is versioned.
    pub version_id: Option<String>,
}

/// Options for a single GET.
#[derive(Debug, Clone, Default)]
pub struct GetOpts {
    /// Inclusive byte range to read; `None` reads the whole object.
    pub range: Option<(u64, u64)>,
    /// Pin the read to a specific version.
    pub version_id: Option<String>,
}

impl GetOpts {
    /// Bytes a successful read must deliver, given the full object size.
    pub fn expected_len(&self, object_size: u64) -> u64 {
        match self.range {
            Some((start, end)) => end - start + 1,
            None => object_size,
        }
    }
}

/// Listing options.
#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub prefix: String,
    /// Descend past the first delimiter level.
    pub recursive: bool,
    /// Enumerate every version instead of only the latest.
    pub with_versions: bool,
}

/// One listed object (or object version).
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: String,
    pub size: u64,
    pub version_id: Option<String>,
}

/// Transport contract the engine drives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stable identifier for the backend, stamped onto operation records.
    fn endpoint(&self) -> String;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create the bucket; succeeds if it already exists.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Turn on version retention for the bucket.
    async fn enable_versioning(&self, bucket: &str) -> Result<()>;

    /// Store `data` under `key`, reporting stored size and version id.
    async fn put(&self, bucket: &str, key: &str, data: &[u8], opts: &PutOpts) -> Result<PutResult>;

    /// Read an object (or a range of it) into `buf`, returning bytes placed.
    async fn get(&self, bucket: &str, key: &str, buf: &mut [u8], opts: &GetOpts) -> Result<u64>;

    /// Stream object listings under a prefix.
    fn list<'a>(&'a self, bucket: &'a str, opts: ListOpts) -> BoxStream<'a, Result<ListEntry>>;

    /// Delete every object whose key starts with one of `prefixes`.
    async fn delete_all(&self, bucket: &str, prefixes: &[String]) -> Result<()>;
}

/// Shared handle to a backend.
pub type StoreRef = Arc<dyn ObjectStore>;

/// Resolve a storage URI to a backend.
///
/// `mem://` gives a fresh in-memory store; `file:///path` roots a
/// filesystem store at `/path`. Anything else is rejected here so an
/// unsupported scheme fails before any worker starts.
pub fn store_for_uri(uri: &str) -> Result<StoreRef> {
    if uri == "mem://" || uri == "mem" {
        return Ok(Arc::new(mem::MemStore::new()));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        if path.is_empty() {
            return Err(anyhow!("file:// URI is missing a path"));
        }
        return Ok(Arc::new(fs::FsStore::new(path)));
    }
    Err(anyhow!(
        "unsupported storage URI {:?} (expected mem:// or file:///path)",
        uri
    ))
}
