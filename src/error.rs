//! Top-level error taxonomy.
//!
//! Each component defines its own narrow error enum (see `device`, `storage`,
//! `kernel::resolver`, `kv_cache`, `numeric`); `DopplerError` aggregates them
//! for callers that cross module boundaries.

use thiserror::Error;

use crate::device::CapabilityError;
use crate::kernel::resolver::KernelPathError;
use crate::kv_cache::KvCacheError;
use crate::numeric::GuardError;
use crate::storage::ShardStoreError;

#[derive(Error, Debug)]
pub enum DopplerError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Shard(#[from] ShardStoreError),

    #[error(transparent)]
    KernelPath(#[from] KernelPathError),

    #[error("pipeline compile failed for shader {shader_label}: {message}")]
    PipelineCompile {
        shader_label: String,
        message: String,
    },

    #[error(transparent)]
    KvCache(#[from] KvCacheError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("decode cancelled")]
    Cancelled,

    #[error("runtime config violation: {0}")]
    ConfigViolation(String),
}
