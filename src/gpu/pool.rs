//! Size-bucketed GPU buffer pool (C2).
//!
//! Scratch buffers (attention scores, FFN intermediates, staging copies) are
//! requested and released every step of the decode loop. Rather than ask
//! `wgpu` for a fresh allocation each time, sizes are rounded up into power-
//! of-two buckets and released buffers are kept on a per-bucket free list —
//! a per-device free-list allocator generalized from fixed-size KV blocks
//! to arbitrary, bucketed scratch sizes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("requested buffer size {0} exceeds the pool's maximum bucket size {1}")]
    TooLarge(u64, u64),
}

/// Rounds a requested size up to the next power-of-two bucket, floored at
/// `MIN_BUCKET`.
const MIN_BUCKET: u64 = 4096;

fn bucket_for(size: u64) -> u64 {
    if size <= MIN_BUCKET {
        return MIN_BUCKET;
    }
    size.next_power_of_two()
}

struct Bucket {
    size: u64,
    free: VecDeque<wgpu::Buffer>,
    total_created: usize,
}

impl Bucket {
    fn new(size: u64) -> Self {
        Self {
            size,
            free: VecDeque::new(),
            total_created: 0,
        }
    }
}

/// A buffer checked out from the pool. Returning it to the pool happens on
/// drop, rather than requiring the caller to free it explicitly.
pub struct PooledBuffer {
    buffer: Option<wgpu::Buffer>,
    bucket_size: u64,
    pool: Arc<Mutex<Inner>>,
}

impl PooledBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        self.buffer.as_ref().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            let mut inner = self.pool.lock().expect("buffer pool lock poisoned");
            inner.release(self.bucket_size, buf);
        }
    }
}

struct Inner {
    buckets: std::collections::BTreeMap<u64, Bucket>,
    max_bucket_bytes: u64,
}

impl Inner {
    fn release(&mut self, bucket_size: u64, buf: wgpu::Buffer) {
        let bucket = self
            .buckets
            .entry(bucket_size)
            .or_insert_with(|| Bucket::new(bucket_size));
        bucket.free.push_back(buf);
    }
}

/// Size-bucketed pool of `wgpu::Buffer`s for a single device.
pub struct BufferPool {
    device: wgpu::Device,
    usage: wgpu::BufferUsages,
    inner: Arc<Mutex<Inner>>,
}

impl BufferPool {
    pub fn new(device: wgpu::Device, usage: wgpu::BufferUsages, max_bucket_bytes: u64) -> Self {
        Self {
            device,
            usage,
            inner: Arc::new(Mutex::new(Inner {
                buckets: std::collections::BTreeMap::new(),
                max_bucket_bytes,
            })),
        }
    }

    /// Acquire a buffer at least `size` bytes. Reuses a released buffer from
    /// the matching bucket when one is available, otherwise allocates a new
    /// one of exactly the bucket size.
    pub fn acquire(&self, size: u64, label: &str) -> Result<PooledBuffer, BufferPoolError> {
        let bucket_size = bucket_for(size);
        let max = self.inner.lock().expect("buffer pool lock poisoned").max_bucket_bytes;
        if bucket_size > max {
            return Err(BufferPoolError::TooLarge(size, max));
        }

        let mut inner = self.inner.lock().expect("buffer pool lock poisoned");
        let bucket = inner
            .buckets
            .entry(bucket_size)
            .or_insert_with(|| Bucket::new(bucket_size));

        let buffer = if let Some(buf) = bucket.free.pop_front() {
            debug!(bucket_size, label, "buffer pool hit");
            buf
        } else {
            bucket.total_created += 1;
            debug!(
                bucket_size,
                label,
                created_total = bucket.total_created,
                "buffer pool miss, allocating"
            );
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bucket_size,
                usage: self.usage,
                mapped_at_creation: false,
            })
        };

        Ok(PooledBuffer {
            buffer: Some(buffer),
            bucket_size,
            pool: self.inner.clone(),
        })
    }

    /// Total bytes currently resident across all buckets (free + checked
    /// out), for telemetry and the heap-testing probe in `RuntimeConfig`.
    pub fn resident_bytes(&self) -> u64 {
        let inner = self.inner.lock().expect("buffer pool lock poisoned");
        inner
            .buckets
            .values()
            .map(|b| b.size * b.total_created as u64)
            .sum()
    }
}
