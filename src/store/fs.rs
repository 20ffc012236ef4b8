// src/store/fs.rs
//! Local-filesystem backend.
//!
//! Buckets are directories under a configured root and keys are relative
//! paths, which is enough to exercise the engine against a real kernel I/O
//! path. Versioning is not supported; discover-mode runs that require
//! version enumeration fail their preconditions instead of pretending.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures::TryFutureExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::store::{GetOpts, ListEntry, ListOpts, ObjectStore, PutOpts, PutResult};

const DELETE_CONCURRENCY: usize = 32;

/// Filesystem-rooted object store.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.bucket_dir(bucket);
        for part in key.split('/') {
            path.push(part);
        }
        path
    }
}

/// Depth-first file walk, returning (absolute path, size) pairs.
async fn walk_files(root: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                files.push((entry.path(), meta.len()));
            }
        }
    }
    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("path {} escaped bucket root", path.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[async_trait]
impl ObjectStore for FsStore {
    fn endpoint(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match fs::metadata(self.bucket_dir(bucket)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("statting bucket directory"),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        fs::create_dir_all(self.bucket_dir(bucket))
            .await
            .with_context(|| format!("creating bucket directory {}", bucket))
    }

    async fn enable_versioning(&self, _bucket: &str) -> Result<()> {
        Err(anyhow!("fs backend does not support versioning"))
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8], _opts: &PutOpts) -> Result<PutResult> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(PutResult { size: data.len() as u64, version_id: None })
    }

    async fn get(&self, bucket: &str, key: &str, buf: &mut [u8], opts: &GetOpts) -> Result<u64> {
        if opts.version_id.is_some() {
            return Err(anyhow!("fs backend does not support versioned reads"));
        }
        let path = self.object_path(bucket, key);
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata().await?.len();

        let (start, len) = match opts.range {
            Some((start, end)) => {
                if start > end || end >= size {
                    return Err(anyhow!(
                        "range {}-{} out of bounds for {} byte object",
                        start,
                        end,
                        size
                    ));
                }
                (start, end - start + 1)
            }
            None => (0, size),
        };

        let len = len as usize;
        if buf.len() < len {
            return Err(anyhow!("destination buffer too small: {} < {}", buf.len(), len));
        }
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        file.read_exact(&mut buf[..len])
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(len as u64)
    }

    fn list<'a>(&'a self, bucket: &'a str, opts: ListOpts) -> BoxStream<'a, Result<ListEntry>> {
        let root = self.bucket_dir(bucket);
        Box::pin(
            async move {
                let mut entries = Vec::new();
                if opts.recursive {
                    for (path, size) in walk_files(&root).await? {
                        let key = relative_key(&root, &path)?;
                        if key.starts_with(&opts.prefix) {
                            entries.push(ListEntry { key, size, version_id: None });
                        }
                    }
                } else {
                    let mut dir = fs::read_dir(&root)
                        .await
                        .with_context(|| format!("listing bucket {}", bucket))?;
                    while let Some(entry) = dir.next_entry().await? {
                        let meta = entry.metadata().await?;
                        if meta.is_dir() {
                            continue;
                        }
                        let key = entry.file_name().to_string_lossy().into_owned();
                        if key.starts_with(&opts.prefix) {
                            entries.push(ListEntry { key, size: meta.len(), version_id: None });
                        }
                    }
                }
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(stream::iter(entries.into_iter().map(Ok)))
            }
            .try_flatten_stream(),
        )
    }

    async fn delete_all(&self, bucket: &str, prefixes: &[String]) -> Result<()> {
        if prefixes.is_empty() {
            return Ok(());
        }
        let root = self.bucket_dir(bucket);
        if !self.bucket_exists(bucket).await? {
            return Err(anyhow!("bucket {} does not exist", bucket));
        }

        let mut targets = Vec::new();
        for (path, _) in walk_files(&root).await? {
            let key = relative_key(&root, &path)?;
            if prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                targets.push(path);
            }
        }

        let results: Vec<Result<()>> = stream::iter(targets.into_iter().map(|path| async move {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("deleting {}", path.display()))
        }))
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;
        for r in results {
            r?;
        }

        // Sweep now-empty prefix directories; leftovers are harmless.
        for prefix in prefixes {
            let dir = self.object_path(bucket, prefix);
            let _ = fs::remove_dir_all(&dir).await;
        }
        Ok(())
    }
}
