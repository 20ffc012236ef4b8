// src/buffer.rs
//! Transfer buffer management.
//!
//! Every worker owns exactly one fixed-capacity buffer for the lifetime of
//! its operation loop: PUTs upload from it, GETs receive into it. Host
//! buffers are page-aligned allocations; device buffers come from a
//! pluggable [`DeviceAllocator`]. Acquire and release are counted so a run
//! can assert that no buffer leaked, whatever path a worker exited on.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Alignment for host buffers, matching direct-I/O friendly page boundaries.
pub const BUFFER_ALIGN: usize = 4096;

/// Which memory the transfer buffers live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryClass {
    #[default]
    Host,
    Device,
}

impl FromStr for MemoryClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(MemoryClass::Host),
            "device" | "gpu" => Ok(MemoryClass::Device),
            other => Err(anyhow!("unknown memory class {:?} (host or device)", other)),
        }
    }
}

/// Allocation seam for device-resident memory.
///
/// The engine never talks to an accelerator runtime itself; embedders hand
/// in an allocator and the pool routes device-class requests through it.
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `len` device-accessible bytes filled with `fill`.
    fn alloc(&self, len: usize, fill: u8) -> Result<NonNull<u8>>;

    /// Release a region previously handed out by [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// `ptr` must come from this allocator's `alloc` with the same `len`,
    /// and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, len: usize);
}

enum Backing {
    Host { layout: Layout },
    Device { allocator: Arc<dyn DeviceAllocator> },
}

/// Hands out per-worker transfer buffers and accounts for their release.
#[derive(Clone)]
pub struct BufferPool {
    class: MemoryClass,
    len: usize,
    device: Option<Arc<dyn DeviceAllocator>>,
    acquired: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

/// Acquire/release totals for a pool, for post-run leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub acquired: u64,
    pub released: u64,
}

impl BufferPool {
    pub fn new(class: MemoryClass, len: usize, device: Option<Arc<dyn DeviceAllocator>>) -> Self {
        Self {
            class,
            len,
            device,
            acquired: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Buffer capacity in bytes.
    pub fn buffer_len(&self) -> usize {
        self.len
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Allocate one buffer filled with `fill`.
    ///
    /// Device-class pools fail here when no [`DeviceAllocator`] was
    /// configured; the caller is expected to treat that as fatal rather
    /// than quietly falling back to host memory.
    pub fn acquire(&self, fill: u8) -> Result<TransferBuffer> {
        if self.len == 0 {
            return Err(anyhow!("buffer length must be at least 1 byte"));
        }
        let (ptr, backing) = match self.class {
            MemoryClass::Host => {
                let layout = Layout::from_size_align(self.len, BUFFER_ALIGN)
                    .with_context(|| format!("bad host buffer layout for {} bytes", self.len))?;
                // Safety: layout has non-zero size (checked above) and the
                // pointer is checked for null below.
                let raw = unsafe { alloc::alloc(layout) };
                let ptr = NonNull::new(raw)
                    .ok_or_else(|| anyhow!("host allocation of {} bytes failed", self.len))?;
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, self.len) };
                (ptr, Backing::Host { layout })
            }
            MemoryClass::Device => {
                let allocator = self
                    .device
                    .clone()
                    .ok_or_else(|| anyhow!("device memory requested but no device allocator is configured"))?;
                let ptr = allocator
                    .alloc(self.len, fill)
                    .context("device allocation failed")?;
                (ptr, Backing::Device { allocator })
            }
        };

        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(TransferBuffer {
            ptr,
            len: self.len,
            class: self.class,
            backing,
            released: Arc::clone(&self.released),
        })
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// A fixed-capacity transfer buffer exclusively owned by one worker.
///
/// Dropping the buffer releases the memory and bumps the pool's release
/// counter exactly once, so cancellation paths cannot leak.
pub struct TransferBuffer {
    ptr: NonNull<u8>,
    len: usize,
    class: MemoryClass,
    backing: Backing,
    released: Arc<AtomicU64>,
}

// The buffer is exclusively owned and the pointer is never aliased, so
// moving it into a worker task is sound. Shared references only permit
// reads, so the region may be read from multiple threads.
unsafe impl Send for TransferBuffer {}
unsafe impl Sync for TransferBuffer {}

impl TransferBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len describe a live allocation we exclusively own.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Host { layout } => {
                // Safety: allocated in acquire() with this exact layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
            Backing::Device { allocator } => {
                // Safety: handed out by this allocator with this length.
                unsafe { allocator.free(self.ptr, self.len) };
            }
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}
