//! doppler-infer-core: browser-side LLM inference core.
//!
//! Four coupled subsystems sit behind this crate's public surface: the
//! kernel-path resolver (`kernel`), the attention + KV-cache engine
//! (`attention`, `kv_cache`), the numeric-stability guard (`numeric`), and
//! the weight/shard storage layer (`storage`, `weights`). `device` and `gpu`
//! provide the capability probe and buffer pool every other module builds
//! on; `layer` and `decode` compose them into a per-token decode loop.

pub mod attention;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod gpu;
pub mod kernel;
pub mod kv_cache;
pub mod layer;
pub mod numeric;
pub mod storage;
pub mod weights;

pub use config::RuntimeConfig;
pub use error::DopplerError;
