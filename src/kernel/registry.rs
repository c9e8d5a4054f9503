//! Kernel registry & pipeline cache (C5).
//!
//! Compiles each unique `(shaderSource, entry, overrideConstants)` exactly
//! once and memoizes the result, following the two-level design of the
//! pipeline cache in the wider example corpus: a canonical key hashed once
//! on cache miss, with the compiled pipeline stored contiguously and handed
//! out by a lightweight id thereafter.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("pipeline compile failed for shader {shader_label}: {message}")]
    Compile {
        shader_label: String,
        message: String,
    },
}

/// Canonical cache key: shader source identity, entry point, and the sorted
/// override-constant set. Override constants are compile-time
/// specialization (workgroup size, `HAS_GATE`, `LAYOUT`, ...); sorting
/// makes the key order-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineKey {
    pub shader_source: String,
    pub entry: String,
    pub overrides: BTreeMap<String, String>,
}

impl Hash for PipelineKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shader_source.hash(state);
        self.entry.hash(state);
        for (k, v) in &self.overrides {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl PipelineKey {
    pub fn new(shader_source: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            shader_source: shader_source.into(),
            entry: entry.into(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

/// One memoized pipeline plus its bind-group layout.
pub struct PipelineCacheEntry {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

/// Process-wide, immutable-after-first-compile pipeline cache.
#[derive(Default)]
pub struct KernelRegistry {
    entries: HashMap<PipelineKey, PipelineCacheEntry>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PipelineKey) -> Option<&PipelineCacheEntry> {
        self.entries.get(key)
    }

    /// Compile on miss, memoize, and return a reference. `compile` is only
    /// invoked when the key is absent.
    pub fn get_or_compile(
        &mut self,
        key: PipelineKey,
        compile: impl FnOnce() -> Result<PipelineCacheEntry, RegistryError>,
    ) -> Result<&PipelineCacheEntry, RegistryError> {
        if !self.entries.contains_key(&key) {
            let entry = compile()?;
            self.entries.insert(key.clone(), entry);
        }
        Ok(self.entries.get(&key).expect("just inserted"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent_over_overrides() {
        let a = PipelineKey::new("attn.wgsl", "main")
            .with_override("HAS_GATE", "1")
            .with_override("LAYOUT", "row");
        let b = PipelineKey::new("attn.wgsl", "main")
            .with_override("LAYOUT", "row")
            .with_override("HAS_GATE", "1");
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        let hash_of = |k: &PipelineKey| {
            let mut h = DefaultHasher::new();
            k.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash_of(&a), hash_of(&b));
    }
}
