//! Runtime configuration consumed (not owned) by the inference core.
//!
//! A nested record of recognized options. The host application owns the
//! full config tree; this crate only reads the sections it understands and
//! validates them before a decode context is allowed to start.

use serde::{Deserialize, Serialize};

/// Activation dtype preference for the default compute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationDtypePref {
    F16,
    F32,
    Auto,
}

impl Default for ActivationDtypePref {
    fn default() -> Self {
        ActivationDtypePref::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub activation_dtype: ActivationDtypePref,
    /// Debug-only: refuse to take effect unless debug/verbose logging is on.
    pub keep_f32_weights: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            activation_dtype: ActivationDtypePref::Auto,
            keep_f32_weights: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Fallback used when the device capability probe doesn't report one.
    pub buffer_alignment_bytes: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            buffer_alignment_bytes: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub alignment: AlignmentConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            alignment: AlignmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    /// Debug-only.
    pub allow_f32_upcast_non_matmul: bool,
    pub storage: StorageConfig,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            allow_f32_upcast_non_matmul: false,
            storage: StorageConfig::default(),
        }
    }
}

/// Overrides auto-selection of the kernel path: either a named path id
/// known to the host, or an inline path document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KernelPathOverride {
    Named(String),
    Inline(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamConfig {
    pub max_tokens: usize,
    pub temperature: f64,
    pub max_output_chars: usize,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            max_output_chars: 16_384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub kernel_path: Option<KernelPathOverride>,
    pub dream: DreamConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            kernel_path: None,
            dream: DreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapTestingConfig {
    pub heap_test_sizes: Vec<usize>,
    pub fallback_max_heap_bytes: usize,
}

impl Default for HeapTestingConfig {
    fn default() -> Self {
        Self {
            heap_test_sizes: vec![256 << 20, 512 << 20, 1 << 30, 2 << 30],
            fallback_max_heap_bytes: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub heap_testing: HeapTestingConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_testing: HeapTestingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDebugConfig {
    pub enabled: bool,
}

impl Default for PipelineDebugConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub pipeline: PipelineDebugConfig,
    pub trace_enabled: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineDebugConfig::default(),
            trace_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    pub debug: DebugConfig,
    pub log_level: LogLevel,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            debug: DebugConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

/// Top-level runtime configuration tree, as consumed (not owned) by the
/// inference core. The host loads this from wherever it keeps its own
/// config (file, env, embedded defaults) and hands it in whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub compute: ComputeConfig,
    pub loading: LoadingConfig,
    pub inference: InferenceConfig,
    pub memory: MemoryConfig,
    pub shared: SharedConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute: ComputeConfig::default(),
            loading: LoadingConfig::default(),
            inference: InferenceConfig::default(),
            memory: MemoryConfig::default(),
            shared: SharedConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file, falling back to defaults if it doesn't exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let cfg: RuntimeConfig = serde_json::from_str(&data)?;
            cfg.validate()
                .map_err(|e| anyhow::anyhow!("invalid runtime config: {e}"))?;
            Ok(cfg)
        } else {
            tracing::warn!(?path, "runtime config file not found, using defaults");
            Ok(RuntimeConfig::default())
        }
    }

    fn debug_unlocked(&self) -> bool {
        self.shared.debug.pipeline.enabled
            || self.shared.debug.trace_enabled
            || matches!(self.shared.log_level, LogLevel::Debug | LogLevel::Verbose)
    }

    /// Reject F32-implying debug flags unless debug/verbose logging is on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.debug_unlocked() {
            if self.compute.keep_f32_weights {
                return Err(
                    "compute.keepF32Weights requires debug/trace/verbose logging to be enabled"
                        .to_string(),
                );
            }
            if self.loading.allow_f32_upcast_non_matmul {
                return Err(
                    "loading.allowF32UpcastNonMatmul requires debug/trace/verbose logging to be enabled"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}
