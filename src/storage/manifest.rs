//! Manifest: the content-addressed index of a curated model's tensors and
//! shards. A small, serde-derived record describing a model's shape, but
//! indexing shard files rather than a single GGUF path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported weight storage dtypes. Distinct from `ActivationDtypePref`:
/// this describes what's actually on disk, not the compute preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDtype {
    F32,
    F16,
    Bf16,
    Q8_0,
    Q4_0,
}

impl WeightDtype {
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            WeightDtype::F32 => 4.0,
            WeightDtype::F16 | WeightDtype::Bf16 => 2.0,
            WeightDtype::Q8_0 => 1.0 + 2.0 / 32.0,
            WeightDtype::Q4_0 => 0.5 + 2.0 / 32.0,
        }
    }

    pub fn is_float_native(&self) -> bool {
        matches!(self, WeightDtype::F16 | WeightDtype::Bf16)
    }
}

/// One tensor's location within the shard set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: WeightDtype,
    pub shard_id: String,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl TensorEntry {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One content-addressed shard file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: String,
    pub url: String,
    pub sha256: String,
    pub byte_length: u64,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("tensor {tensor} references unknown shard {shard}")]
    UnknownShard { tensor: String, shard: String },

    #[error("tensor {tensor} byte range [{offset}, {end}) exceeds shard {shard} length {shard_len}")]
    OutOfBounds {
        tensor: String,
        shard: String,
        offset: u64,
        end: u64,
        shard_len: u64,
    },

    #[error("duplicate tensor name: {0}")]
    DuplicateTensor(String),
}

/// Top-level manifest document (`manifest.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub model_id: String,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub sliding_window: Option<usize>,
    pub tensors: Vec<TensorEntry>,
    pub shards: Vec<ShardEntry>,
}

impl Manifest {
    /// Validate internal consistency: every tensor's shard reference
    /// resolves, and its byte range fits inside that shard.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let shard_lens: HashMap<&str, u64> = self
            .shards
            .iter()
            .map(|s| (s.id.as_str(), s.byte_length))
            .collect();

        let mut seen = std::collections::HashSet::new();
        for tensor in &self.tensors {
            if !seen.insert(tensor.name.as_str()) {
                return Err(ManifestError::DuplicateTensor(tensor.name.clone()));
            }

            let shard_len = *shard_lens
                .get(tensor.shard_id.as_str())
                .ok_or_else(|| ManifestError::UnknownShard {
                    tensor: tensor.name.clone(),
                    shard: tensor.shard_id.clone(),
                })?;

            let end = tensor.byte_offset + tensor.byte_length;
            if end > shard_len {
                return Err(ManifestError::OutOfBounds {
                    tensor: tensor.name.clone(),
                    shard: tensor.shard_id.clone(),
                    offset: tensor.byte_offset,
                    end,
                    shard_len,
                });
            }
        }
        Ok(())
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn shard(&self, id: &str) -> Option<&ShardEntry> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Bytes of KV storage required per token across all layers, at the
    /// given storage dtype.
    pub fn kv_bytes_per_token(&self, kv_dtype: WeightDtype) -> u64 {
        let per_layer = self.n_kv_heads as f64 * self.head_dim as f64 * kv_dtype.bytes_per_element() * 2.0;
        (per_layer * self.n_layers as f64).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            model_id: "doppler-test-7b".to_string(),
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 64,
            sliding_window: Some(4096),
            tensors: vec![TensorEntry {
                name: "blk.0.attn_q.weight".to_string(),
                shape: vec![256, 256],
                dtype: WeightDtype::F16,
                shard_id: "shard-0".to_string(),
                byte_offset: 0,
                byte_length: 256 * 256 * 2,
            }],
            shards: vec![ShardEntry {
                id: "shard-0".to_string(),
                url: "https://example.invalid/shard-0.bin".to_string(),
                sha256: "0".repeat(64),
                byte_length: 256 * 256 * 2,
            }],
        }
    }

    #[test]
    fn valid_manifest_passes() {
        assert!(sample_manifest().validate().is_ok());
    }

    #[test]
    fn unknown_shard_rejected() {
        let mut m = sample_manifest();
        m.tensors[0].shard_id = "missing".to_string();
        assert!(matches!(
            m.validate(),
            Err(ManifestError::UnknownShard { .. })
        ));
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mut m = sample_manifest();
        m.tensors[0].byte_length += 1;
        assert!(matches!(
            m.validate(),
            Err(ManifestError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn duplicate_tensor_rejected() {
        let mut m = sample_manifest();
        let dup = m.tensors[0].clone();
        m.tensors.push(dup);
        assert!(matches!(
            m.validate(),
            Err(ManifestError::DuplicateTensor(_))
        ));
    }
}
