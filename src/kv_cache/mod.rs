//! Per-layer KV cache (C7).
//!
//! One ring of K and V tensors per layer, shaped `[maxSeqLen, kvHeads,
//! headDim]`. Allocated whole at decode-context init — no per-step frees;
//! writes are append-only in decode, batched in prefill.
//! A `BlockTable`-style tier that maps token positions to fixed-size blocks
//! for eviction doesn't apply here: the browser-side case has exactly one
//! tier and no eviction, so this is a flat, contiguous buffer per layer
//! indexed directly by position.

use thiserror::Error;

use crate::storage::manifest::WeightDtype;

#[derive(Error, Debug)]
pub enum KvCacheError {
    #[error("write at position {position} exceeds max sequence length {max_seq_len}")]
    Overflow { position: usize, max_seq_len: usize },

    #[error("layer index {layer} out of range (n_layers={n_layers})")]
    LayerOutOfRange { layer: usize, n_layers: usize },
}

/// One layer's K and V storage. Kept as plain `Vec<f32>` host-side mirrors
/// in this module; the GPU-resident buffers backing the live tensors are
/// owned by the attention engine via the buffer pool, this type only tracks
/// the logical write cursor and bounds.
pub struct LayerKv {
    pub max_seq_len: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub dtype: WeightDtype,
    pub sliding_window: Option<usize>,
    committed_len: usize,
}

impl LayerKv {
    fn new(max_seq_len: usize, kv_heads: usize, head_dim: usize, dtype: WeightDtype, sliding_window: Option<usize>) -> Self {
        Self {
            max_seq_len,
            kv_heads,
            head_dim,
            dtype,
            sliding_window,
            committed_len: 0,
        }
    }

    pub fn committed_len(&self) -> usize {
        self.committed_len
    }

    /// Validate (and, on success, advance the cursor for) a decode-step
    /// append at `position`. Sliding-window layers still allocate full
    /// length; the window is enforced by masking in the attention engine,
    /// not by the cache's own bounds check.
    fn check_and_advance(&mut self, position: usize) -> Result<(), KvCacheError> {
        if position >= self.max_seq_len {
            return Err(KvCacheError::Overflow {
                position,
                max_seq_len: self.max_seq_len,
            });
        }
        if position + 1 > self.committed_len {
            self.committed_len = position + 1;
        }
        Ok(())
    }

    /// Whether position `key_pos` is visible to a query at `query_pos`
    /// under this layer's sliding-window setting.
    pub fn is_visible(&self, query_pos: usize, key_pos: usize) -> bool {
        if key_pos > query_pos {
            return false;
        }
        match self.sliding_window {
            Some(w) => query_pos.saturating_sub(key_pos) < w,
            None => true,
        }
    }
}

/// The full KV cache for one decode context: one `LayerKv` per model layer.
/// KV dtype follows the activation dtype unless overridden; `kv_dtype`
/// accepts that override directly rather than deriving it, per the Open
/// Question decision in DESIGN.md to keep the two coupled by default while
/// leaving the API ready for decoupling.
pub struct KvCache {
    layers: Vec<LayerKv>,
}

impl KvCache {
    pub fn new(
        n_layers: usize,
        max_seq_len: usize,
        kv_heads: usize,
        head_dim: usize,
        activation_dtype: WeightDtype,
        sliding_window: Option<usize>,
        kv_dtype_override: Option<WeightDtype>,
    ) -> Self {
        let dtype = kv_dtype_override.unwrap_or(activation_dtype);
        let layers = (0..n_layers)
            .map(|_| LayerKv::new(max_seq_len, kv_heads, head_dim, dtype, sliding_window))
            .collect();
        Self { layers }
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerKv, KvCacheError> {
        self.layers.get(layer).ok_or(KvCacheError::LayerOutOfRange {
            layer,
            n_layers: self.layers.len(),
        })
    }

    /// Record a decode-step append at `position` for `layer`. Actual byte
    /// writes happen on the GPU side; this call is the bookkeeping gate the
    /// attention engine calls after the finiteness guard commits.
    pub fn record_write(&mut self, layer: usize, position: usize) -> Result<(), KvCacheError> {
        let n_layers = self.layers.len();
        let l = self
            .layers
            .get_mut(layer)
            .ok_or(KvCacheError::LayerOutOfRange { layer, n_layers })?;
        l.check_and_advance(position)
    }

    /// Record a prefill batch write covering `[0, seq_len)` for `layer`.
    pub fn record_prefill(&mut self, layer: usize, seq_len: usize) -> Result<(), KvCacheError> {
        if seq_len == 0 {
            return Ok(());
        }
        self.record_write(layer, seq_len - 1)
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }
}
