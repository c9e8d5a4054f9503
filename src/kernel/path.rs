//! `KernelPath` data model: `KernelPath` and `Step`.
//!
//! A path is the declarative routing table the resolver consults: ordered
//! steps per phase, optional per-layer overrides, and optional pre/post-layer
//! and sampling sections. Serialized as JSON the same way `RuntimeConfig` is.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-step compute dtype attribute, read by the numeric-stability guard
/// instead of ad-hoc string flags (see DESIGN NOTES: "mixed-precision
/// branching via string flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    F16,
    F32,
    Mixed,
}

/// One unit of work within a phase: an abstract op bound to a concrete
/// shader entry point, with its input/output tensor names and any weight
/// references (which may carry an unexpanded `{L}` layer-index template).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub op: String,
    pub kernel: String,
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub weight_refs: Vec<String>,
    #[serde(default)]
    pub constants: HashMap<String, serde_json::Value>,
    #[serde(default = "default_compute_dtype")]
    pub compute: ComputeDtype,
}

fn default_entry() -> String {
    "main".to_string()
}

fn default_compute_dtype() -> ComputeDtype {
    ComputeDtype::Mixed
}

/// A named bundle of steps for one phase (decode, prefill, preLayer, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBlock {
    pub steps: Vec<Step>,
}

/// Steps that replace a phase's defaults for a specific set of layer
/// indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerOverride {
    pub layers: Vec<usize>,
    pub steps: HashMap<String, Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelPath {
    pub id: String,
    pub name: String,
    pub decode: StepBlock,
    #[serde(default)]
    pub prefill: Option<StepBlock>,
    #[serde(default)]
    pub pre_layer: Option<StepBlock>,
    #[serde(default)]
    pub post_layer: Option<StepBlock>,
    #[serde(default)]
    pub sampling: Option<StepBlock>,
    #[serde(default)]
    pub layer_overrides: Vec<LayerOverride>,
}

impl KernelPath {
    pub fn override_for_layer(&self, layer_index: usize) -> Option<&LayerOverride> {
        self.layer_overrides
            .iter()
            .find(|o| o.layers.contains(&layer_index))
    }
}
