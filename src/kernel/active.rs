//! Active path registry: which kernel path a decode context is currently
//! bound to, and how it got chosen.
//!
//! A process-wide singleton is deliberately NOT used here (a module-level
//! active-path singleton was flagged for re-architecture) — instead this is
//! a small handle threaded through the decode context, one per in-flight
//! decode, the way a `SharedPager` handle gets passed explicitly rather
//! than reached for as global state.

use super::path::KernelPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    Runtime,
    Config,
    Model,
    Manifest,
    Auto,
    None,
}

impl PathSource {
    /// Strict sources forbid implicit re-selection mid-decode.
    pub fn is_strict(&self) -> bool {
        !matches!(self, PathSource::Auto | PathSource::None)
    }
}

/// Per-decode-context handle naming which path is active and how it got
/// there.
pub struct ActivePathRegistry {
    path: KernelPath,
    source: PathSource,
}

impl ActivePathRegistry {
    pub fn new(path: KernelPath, source: PathSource) -> Self {
        Self { path, source }
    }

    pub fn set_active(&mut self, path: KernelPath, source: PathSource) {
        self.path = path;
        self.source = source;
    }

    pub fn get_active(&self) -> &KernelPath {
        &self.path
    }

    pub fn get_source(&self) -> PathSource {
        self.source
    }

    pub fn is_strict(&self) -> bool {
        self.source.is_strict()
    }
}
