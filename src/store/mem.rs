// src/store/mem.rs
//! In-memory reference backend.
//!
//! Deterministic and fully versioned, which makes it the fixture for engine
//! tests; `mem://` URIs also resolve here so a config can be dry-run
//! without touching real storage.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;

use crate::store::{GetOpts, ListEntry, ListOpts, ObjectStore, PutOpts, PutResult};

struct Version {
    id: Option<String>,
    data: Bytes,
}

#[derive(Default)]
struct BucketState {
    versioned: bool,
    next_version: u64,
    // Key -> versions, oldest first.
    objects: BTreeMap<String, Vec<Version>>,
}

/// Thread-safe in-memory object store.
#[derive(Default)]
pub struct MemStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys in the bucket (not versions).
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .map(|b| b.objects.len())
            .unwrap_or(0)
    }

    /// Number of stored versions for one key.
    pub fn version_count(&self, bucket: &str, key: &str) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// All keys in the bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    fn endpoint(&self) -> String {
        "mem:local".to_string()
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| anyhow!("bucket {} does not exist", bucket))?;
        state.versioned = true;
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8], _opts: &PutOpts) -> Result<PutResult> {
        let mut buckets = self.buckets.lock();
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| anyhow!("bucket {} does not exist", bucket))?;

        let id = if state.versioned {
            state.next_version += 1;
            Some(format!("{:016x}", state.next_version))
        } else {
            None
        };
        let version = Version { id: id.clone(), data: Bytes::copy_from_slice(data) };

        let versions = state.objects.entry(key.to_string()).or_default();
        if state.versioned {
            versions.push(version);
        } else {
            *versions = vec![version];
        }
        Ok(PutResult { size: data.len() as u64, version_id: id })
    }

    async fn get(&self, bucket: &str, key: &str, buf: &mut [u8], opts: &GetOpts) -> Result<u64> {
        let buckets = self.buckets.lock();
        let state = buckets
            .get(bucket)
            .ok_or_else(|| anyhow!("bucket {} does not exist", bucket))?;
        let versions = state
            .objects
            .get(key)
            .ok_or_else(|| anyhow!("object {} not found", key))?;

        let version = match &opts.version_id {
            Some(id) => versions
                .iter()
                .find(|v| v.id.as_deref() == Some(id.as_str()))
                .ok_or_else(|| anyhow!("version {} of {} not found", id, key))?,
            None => versions
                .last()
                .ok_or_else(|| anyhow!("object {} has no versions", key))?,
        };

        let data: &[u8] = &version.data;
        let slice = match opts.range {
            Some((start, end)) => {
                if start > end || end >= data.len() as u64 {
                    return Err(anyhow!(
                        "range {}-{} out of bounds for {} byte object",
                        start,
                        end,
                        data.len()
                    ));
                }
                &data[start as usize..=end as usize]
            }
            None => data,
        };

        if buf.len() < slice.len() {
            return Err(anyhow!(
                "destination buffer too small: {} < {}",
                buf.len(),
                slice.len()
            ));
        }
        buf[..slice.len()].copy_from_slice(slice);
        Ok(slice.len() as u64)
    }

    fn list<'a>(&'a self, bucket: &'a str, opts: ListOpts) -> BoxStream<'a, Result<ListEntry>> {
        let buckets = self.buckets.lock();
        let mut entries = Vec::new();
        match buckets.get(bucket) {
            None => entries.push(Err(anyhow!("bucket {} does not exist", bucket))),
            Some(state) => {
                for (key, versions) in state.objects.range(opts.prefix.clone()..) {
                    if !key.starts_with(&opts.prefix) {
                        break;
                    }
                    if !opts.recursive && key[opts.prefix.len()..].contains('/') {
                        continue;
                    }
                    if opts.with_versions {
                        // Newest first, the way versioned listings arrive.
                        for v in versions.iter().rev() {
                            entries.push(Ok(ListEntry {
                                key: key.clone(),
                                size: v.data.len() as u64,
                                version_id: v.id.clone(),
                            }));
                        }
                    } else if let Some(v) = versions.last() {
                        entries.push(Ok(ListEntry {
                            key: key.clone(),
                            size: v.data.len() as u64,
                            version_id: v.id.clone(),
                        }));
                    }
                }
            }
        }
        drop(buckets);
        Box::pin(stream::iter(entries))
    }

    async fn delete_all(&self, bucket: &str, prefixes: &[String]) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| anyhow!("bucket {} does not exist", bucket))?;
        state
            .objects
            .retain(|key, _| !prefixes.iter().any(|p| key.starts_with(p.as_str())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn unversioned_puts_overwrite() {
        let store = MemStore::new();
        store.create_bucket("b").await.unwrap();
        let opts = PutOpts::default();
        let r1 = store.put("b", "k", b"one", &opts).await.unwrap();
        let r2 = store.put("b", "k", b"two!", &opts).await.unwrap();
        assert_eq!(r1.version_id, None);
        assert_eq!(r2.size, 4);
        assert_eq!(store.version_count("b", "k"), 1);
    }

    #[tokio::test]
    async fn versioned_puts_accumulate_distinct_ids() {
        let store = MemStore::new();
        store.create_bucket("b").await.unwrap();
        store.enable_versioning("b").await.unwrap();
        let opts = PutOpts::default();
        let r1 = store.put("b", "k", b"one", &opts).await.unwrap();
        let r2 = store.put("b", "k", b"two", &opts).await.unwrap();
        assert_ne!(r1.version_id, r2.version_id);
        assert_eq!(store.version_count("b", "k"), 2);

        // Pinned read sees the old payload, unpinned the newest.
        let mut buf = [0u8; 8];
        let opts1 = GetOpts { version_id: r1.version_id, ..Default::default() };
        let n = store.get("b", "k", &mut buf, &opts1).await.unwrap();
        assert_eq!(&buf[..n as usize], b"one");
        let n = store.get("b", "k", &mut buf, &GetOpts::default()).await.unwrap();
        assert_eq!(&buf[..n as usize], b"two");
    }

    #[tokio::test]
    async fn ranged_get_is_inclusive_and_bounded() {
        let store = MemStore::new();
        store.create_bucket("b").await.unwrap();
        store.put("b", "k", b"0123456789", &PutOpts::default()).await.unwrap();

        let mut buf = [0u8; 16];
        let opts = GetOpts { range: Some((2, 5)), ..Default::default() };
        let n = store.get("b", "k", &mut buf, &opts).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"2345");

        let bad = GetOpts { range: Some((5, 10)), ..Default::default() };
        assert!(store.get("b", "k", &mut buf, &bad).await.is_err());
    }

    #[tokio::test]
    async fn listing_respects_prefix_recursion_and_versions() {
        let store = MemStore::new();
        store.create_bucket("b").await.unwrap();
        store.enable_versioning("b").await.unwrap();
        let opts = PutOpts::default();
        store.put("b", "a/1.dat", b"xx", &opts).await.unwrap();
        store.put("b", "a/1.dat", b"yy", &opts).await.unwrap();
        store.put("b", "a/2.dat", b"zz", &opts).await.unwrap();
        store.put("b", "top.dat", b"tt", &opts).await.unwrap();

        let all: Vec<_> = store
            .list("b", ListOpts { recursive: true, with_versions: true, ..Default::default() })
            .collect()
            .await;
        assert_eq!(all.len(), 4);

        let under_a: Vec<_> = store
            .list("b", ListOpts { prefix: "a/".into(), recursive: true, ..Default::default() })
            .collect()
            .await;
        assert_eq!(under_a.len(), 2);

        let flat: Vec<_> = store
            .list("b", ListOpts { recursive: false, ..Default::default() })
            .collect()
            .await;
        let keys: Vec<String> = flat.into_iter().map(|e| e.unwrap().key).collect();
        assert_eq!(keys, vec!["top.dat".to_string()]);
    }

    #[tokio::test]
    async fn delete_all_removes_only_named_prefixes() {
        let store = MemStore::new();
        store.create_bucket("b").await.unwrap();
        let opts = PutOpts::default();
        store.put("b", "1-xx-0/a.dat", b"x", &opts).await.unwrap();
        store.put("b", "1-xx-1/b.dat", b"x", &opts).await.unwrap();
        store.put("b", "keep/c.dat", b"x", &opts).await.unwrap();

        store
            .delete_all("b", &["1-xx-0".to_string(), "1-xx-1".to_string()])
            .await
            .unwrap();
        assert_eq!(store.keys("b"), vec!["keep/c.dat".to_string()]);
    }
}
