//! Kernel-path resolver and pipeline cache (C5, C6).

pub mod active;
pub mod path;
pub mod registry;
pub mod resolver;

pub use active::{ActivePathRegistry, PathSource};
pub use path::{ComputeDtype, KernelPath, LayerOverride, Step};
pub use registry::{KernelRegistry, PipelineKey};
pub use resolver::{KernelPathError, ResolvedPath};
