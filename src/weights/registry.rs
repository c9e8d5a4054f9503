//! Weight handle lifecycle: unloaded → loading → resident → evicted.
//!
//! A `WeightHandle` tracks one tensor's GPU residency independent of its
//! backing shard; the registry is the map from tensor name to handle. A
//! `BlockTable`-style mapping from position to fixed-size block doesn't fit
//! here since the unit is a whole tensor, not a block.

use std::collections::HashMap;
use std::sync::Arc;

use half::f16;

use crate::gpu::pool::{BufferPool, PooledBuffer};
use crate::storage::manifest::{Manifest, TensorEntry, WeightDtype};
use crate::storage::shard_store::{ShardStore, ShardStoreError};

/// Widen a tensor's raw on-disk bytes to `f32`, the form the safest
/// (non-fused) dequant kernel path and the CPU-side numeric-guard fallback
/// both expect. Quantized dtypes aren't unpacked here — only float-native
/// storage, since block dequantization is a kernel-side concern.
pub fn dequantize_to_f32(bytes: &[u8], dtype: WeightDtype) -> Result<Vec<f32>, ShardStoreError> {
    match dtype {
        WeightDtype::F32 => Ok(bytemuck::cast_slice::<u8, f32>(bytes).to_vec()),
        WeightDtype::F16 => Ok(bytemuck::cast_slice::<u8, f16>(bytes)
            .iter()
            .map(|h| h.to_f32())
            .collect()),
        WeightDtype::Bf16 => Ok(bytemuck::cast_slice::<u8, half::bf16>(bytes)
            .iter()
            .map(|h| h.to_f32())
            .collect()),
        WeightDtype::Q8_0 | WeightDtype::Q4_0 => Err(ShardStoreError::Fetch {
            shard_id: String::new(),
            url: String::new(),
            message: format!("{dtype:?} requires block dequantization, not a flat cast"),
        }),
    }
}

#[derive(Debug, Clone)]
pub enum WeightState {
    Unloaded,
    Loading,
    Resident,
    Evicted,
}

/// One tensor's GPU residency state. Cloning shares the underlying buffer
/// (`Arc`), handing out cheap shared handles rather than copying cache
/// state.
pub struct WeightHandle {
    pub name: String,
    pub dtype: WeightDtype,
    pub shape: Vec<usize>,
    state: WeightState,
    buffer: Option<Arc<PooledBuffer>>,
}

impl WeightHandle {
    fn new(entry: &TensorEntry) -> Self {
        Self {
            name: entry.name.clone(),
            dtype: entry.dtype,
            shape: entry.shape.clone(),
            state: WeightState::Unloaded,
            buffer: None,
        }
    }

    pub fn state(&self) -> &WeightState {
        &self.state
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.as_ref().map(|b| b.buffer())
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.state, WeightState::Resident)
    }
}

/// Registry of weight handles for one loaded manifest.
pub struct WeightRegistry {
    manifest: Manifest,
    handles: HashMap<String, WeightHandle>,
}

impl WeightRegistry {
    pub fn new(manifest: Manifest) -> Self {
        let handles = manifest
            .tensors
            .iter()
            .map(|t| (t.name.clone(), WeightHandle::new(t)))
            .collect();
        Self { manifest, handles }
    }

    pub fn get(&self, name: &str) -> Option<&WeightHandle> {
        self.handles.get(name)
    }

    /// Lazily upload a tensor to the GPU: fetches its bytes through the
    /// shard store (which no-ops if already cached), uploads into a pooled
    /// buffer, and marks the handle resident.
    pub async fn load(
        &mut self,
        name: &str,
        shard_store: &ShardStore,
        queue: &wgpu::Queue,
        pool: &BufferPool,
    ) -> Result<(), ShardStoreError> {
        let handle = self
            .handles
            .get_mut(name)
            .ok_or_else(|| ShardStoreError::UnknownShard(name.to_string()))?;

        if handle.is_resident() {
            return Ok(());
        }
        handle.state = WeightState::Loading;

        let bytes = shard_store.read_tensor_bytes(&self.manifest, name).await?;

        let pooled = pool
            .acquire(bytes.len() as u64, name)
            .map_err(|e| ShardStoreError::Fetch {
                shard_id: name.to_string(),
                url: String::new(),
                message: e.to_string(),
            })?;
        queue.write_buffer(pooled.buffer(), 0, &bytes);
        handle.buffer = Some(Arc::new(pooled));
        handle.state = WeightState::Resident;

        Ok(())
    }

    /// Drop GPU residency for a tensor, returning its buffer to the pool.
    pub fn evict(&mut self, name: &str) {
        if let Some(handle) = self.handles.get_mut(name) {
            handle.buffer = None;
            handle.state = WeightState::Evicted;
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}
