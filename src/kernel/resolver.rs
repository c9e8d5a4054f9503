//! Resolve `(manifest, runtimeConfig, deviceCaps)` into a ResolvedPath, and
//! the auto-selection rule table.

use thiserror::Error;

use crate::device::DeviceCaps;
use crate::storage::manifest::{Manifest, WeightDtype};

use super::path::{KernelPath, Step};

#[derive(Error, Debug)]
pub enum KernelPathError {
    #[error("unknown kernel path: {0}")]
    UnknownKernelPath(String),

    #[error("invalid kernel path {path_id}: {reason}")]
    InvalidKernelPath { path_id: String, reason: String },

    #[error("no step for matmul role {role:?} in path {path_id} ({phase:?})")]
    UnknownMatmulRole {
        path_id: String,
        role: crate::attention::MatmulRole,
        phase: Phase,
    },

    #[error(
        "matmul role {role:?} resolved to {kernel}#{entry}, which the variant table can't \
         attribute to exactly one registered variant, and the active path is strict"
    )]
    SilentFallbackRefused {
        role: crate::attention::MatmulRole,
        kernel: String,
        entry: String,
    },
}

/// Decode/prefill phase selector, used by `getLayerSteps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

/// A fully validated path plus the source it came from, mirroring the
/// `ActivePathRegistry` entry this resolution will be installed as.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub path: KernelPath,
    pub source: super::active::PathSource,
}

/// Validate structural invariants: an id, a name, ≥1 decode step, and every
/// step in every present block declares an op and a kernel (non-empty).
pub fn validate(path: &KernelPath) -> Result<(), KernelPathError> {
    if path.id.is_empty() {
        return Err(KernelPathError::InvalidKernelPath {
            path_id: path.id.clone(),
            reason: "path id must not be empty".to_string(),
        });
    }
    if path.name.is_empty() {
        return Err(KernelPathError::InvalidKernelPath {
            path_id: path.id.clone(),
            reason: "path name must not be empty".to_string(),
        });
    }
    if path.decode.steps.is_empty() {
        return Err(KernelPathError::InvalidKernelPath {
            path_id: path.id.clone(),
            reason: "decode block must declare at least one step".to_string(),
        });
    }

    let check_step = |step: &Step| -> Result<(), KernelPathError> {
        if step.op.is_empty() || step.kernel.is_empty() {
            return Err(KernelPathError::InvalidKernelPath {
                path_id: path.id.clone(),
                reason: format!("step with op={:?} missing op or kernel", step.op),
            });
        }
        Ok(())
    };

    for step in &path.decode.steps {
        check_step(step)?;
    }
    for block in [&path.prefill, &path.pre_layer, &path.post_layer, &path.sampling] {
        if let Some(block) = block {
            for step in &block.steps {
                check_step(step)?;
            }
        }
    }
    for over in &path.layer_overrides {
        for step in over.steps.values() {
            check_step(step)?;
        }
    }

    Ok(())
}

/// Quantization class of a model's main weights, derived from the manifest's
/// dominant tensor dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantClass {
    F16Native,
    Q4K,
    Other,
}

pub fn quant_class_of(manifest: &Manifest) -> QuantClass {
    let dominant = manifest
        .tensors
        .iter()
        .find(|t| t.name.contains("attn_q.weight"))
        .map(|t| t.dtype)
        .unwrap_or(WeightDtype::F16);

    match dominant {
        WeightDtype::F16 | WeightDtype::Bf16 => QuantClass::F16Native,
        WeightDtype::Q4_0 => QuantClass::Q4K,
        _ => QuantClass::Other,
    }
}

/// Auto-selection rules, in priority order.
pub fn auto_select(quant: QuantClass, family: &str, caps: &DeviceCaps) -> String {
    match quant {
        QuantClass::F16Native => format!("{family}-f16-native"),
        QuantClass::Q4K if caps.has_subgroups => format!("{family}-q4k-fused"),
        QuantClass::Q4K if caps.has_f16 => format!("{family}-q4k-dequant-f16"),
        QuantClass::Q4K => format!("{family}-q4k-dequant-f32"),
        QuantClass::Other => format!("{family}-q4k-dequant-f32"),
    }
}

/// Substitute `{L}` tokens in a weight-ref template with a layer index.
/// Idempotent: no `{L}` survives in the output, so repeated substitution
/// is a no-op.
pub fn resolve_weight_ref(template: &str, layer_index: usize) -> String {
    template.replace("{L}", &layer_index.to_string())
}

/// Architecture families a built-in variant set ships for. A family not in
/// this list still resolves: `PathTable::lookup` falls back to the
/// family-less generic alias for whichever variant `autoSelect` picked.
const BUILTIN_FAMILIES: &[&str] = &["gemma2", "gemma3"];

/// The four auto-selectable precision/quantization variants, matching
/// `autoSelect`'s four possible ids (minus its generic-fallback suffix).
const BUILTIN_VARIANTS: &[&str] = &["q4k-fused", "q4k-dequant-f32", "q4k-dequant-f16", "f16-native"];

/// A minimal, structurally valid single-step path for a built-in variant.
/// Real per-family presets carry many steps (RoPE, multiple matmul roles,
/// FFN); this is the placeholder shape the built-in registry ships until a
/// host supplies richer per-family JSON via `register`.
fn builtin_variant(id: impl Into<String>) -> KernelPath {
    let id = id.into();
    KernelPath {
        name: id.clone(),
        decode: super::path::StepBlock {
            steps: vec![Step {
                op: "attention".to_string(),
                kernel: format!("{id}.wgsl"),
                entry: "main".to_string(),
                inputs: vec![],
                outputs: vec![],
                weight_refs: vec!["blk.{L}.attn_q.weight".to_string()],
                constants: std::collections::HashMap::new(),
                compute: super::path::ComputeDtype::Mixed,
            }],
        },
        prefill: None,
        pre_layer: None,
        post_layer: None,
        sampling: None,
        layer_overrides: vec![],
        id,
    }
}

/// Registry of built-in and user-registered paths, keyed by id. Families
/// register entries at process init (DESIGN NOTES: "dynamic imports of
/// per-family preset JSON" → static registry + tagged dispatch).
#[derive(Default)]
pub struct PathTable {
    paths: std::collections::HashMap<String, KernelPath>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `PathTable` pre-populated with the built-in registry: the four
    /// variants per known family plus family-less generic aliases, so
    /// `resolve(..., None, ...)` succeeds for any family out of the box.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register_builtins();
        table
    }

    /// Install the built-in variant set into an existing table. Idempotent
    /// to call more than once (later registration just overwrites the same
    /// ids with the same content).
    pub fn register_builtins(&mut self) {
        for family in BUILTIN_FAMILIES {
            for variant in BUILTIN_VARIANTS {
                let id = format!("{family}-{variant}");
                self.register(builtin_variant(id))
                    .expect("built-in path is structurally valid");
            }
        }
        for variant in BUILTIN_VARIANTS {
            self.register(builtin_variant(*variant))
                .expect("built-in path is structurally valid");
        }
    }

    pub fn register(&mut self, path: KernelPath) -> Result<(), KernelPathError> {
        validate(&path)?;
        self.paths.insert(path.id.clone(), path);
        Ok(())
    }

    /// Look up by family-prefixed id first, then the generic id.
    fn lookup(&self, family: &str, bare_id: &str) -> Option<&KernelPath> {
        let prefixed = format!("{family}-{bare_id}");
        self.paths
            .get(&prefixed)
            .or_else(|| self.paths.get(bare_id))
    }

    pub fn get(&self, id: &str) -> Option<&KernelPath> {
        self.paths.get(id)
    }

    /// All registered `(id, path)` pairs, in no particular order. Used to
    /// build the kernel registry variant table the matmul role lookup
    /// reverse-indexes against.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &KernelPath)> {
        self.paths.iter()
    }

    /// `resolve(manifestMeta, runtimeOverride?, caps) -> ResolvedPath`.
    pub fn resolve(
        &self,
        manifest: &Manifest,
        family: &str,
        runtime_override: Option<&str>,
        caps: &DeviceCaps,
    ) -> Result<ResolvedPath, KernelPathError> {
        if let Some(explicit_id) = runtime_override {
            let path = self
                .paths
                .get(explicit_id)
                .ok_or_else(|| KernelPathError::UnknownKernelPath(explicit_id.to_string()))?;
            validate(path)?;
            return Ok(ResolvedPath {
                path: path.clone(),
                source: super::active::PathSource::Runtime,
            });
        }

        let quant = quant_class_of(manifest);
        let auto_id = auto_select(quant, family, caps);
        let bare_suffix = auto_id.strip_prefix(&format!("{family}-")).unwrap_or(&auto_id);

        let path = self
            .lookup(family, bare_suffix)
            .or_else(|| self.paths.get(&auto_id))
            .ok_or_else(|| KernelPathError::UnknownKernelPath(auto_id.clone()))?;
        validate(path)?;

        Ok(ResolvedPath {
            path: path.clone(),
            source: super::active::PathSource::Auto,
        })
    }
}

/// `getLayerSteps(path, layerIndex, phase)`.
///
/// Layer overrides take precedence over the phase's defaults, replacing
/// only the ops they name; prefill falls back to decode steps when no
/// prefill block is declared.
pub fn get_layer_steps(path: &KernelPath, layer_index: usize, phase: Phase) -> Vec<Step> {
    let mut steps = match phase {
        Phase::Decode => path.decode.steps.clone(),
        Phase::Prefill => path
            .prefill
            .as_ref()
            .map(|b| b.steps.clone())
            .unwrap_or_else(|| path.decode.steps.clone()),
    };

    if let Some(over) = path.override_for_layer(layer_index) {
        for step in steps.iter_mut() {
            if let Some(replacement) = over.steps.get(&step.op) {
                *step = replacement.clone();
            }
        }
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCaps;
    use std::collections::HashMap as Map;

    fn step(op: &str, kernel: &str) -> Step {
        Step {
            op: op.to_string(),
            kernel: kernel.to_string(),
            entry: "main".to_string(),
            inputs: vec![],
            outputs: vec![],
            weight_refs: vec![format!("blk.{{L}}.{op}.weight")],
            constants: Map::new(),
            compute: super::super::path::ComputeDtype::Mixed,
        }
    }

    fn sample_path(id: &str) -> KernelPath {
        KernelPath {
            id: id.to_string(),
            name: id.to_string(),
            decode: super::super::path::StepBlock {
                steps: vec![step("attention", "attn_a.wgsl")],
            },
            prefill: None,
            pre_layer: None,
            post_layer: None,
            sampling: None,
            layer_overrides: vec![super::super::path::LayerOverride {
                layers: vec![12],
                steps: Map::from([("attention".to_string(), step("attention", "attn_b.wgsl"))]),
            }],
        }
    }

    #[test]
    fn auto_select_scenario_1_q4k_subgroups_f16() {
        let caps = DeviceCaps::synthetic(true, true, 32, 4 << 30);
        let id = auto_select(QuantClass::Q4K, "gemma2", &caps);
        assert_eq!(id, "gemma2-q4k-fused");
    }

    #[test]
    fn auto_select_scenario_2_q4k_no_subgroups_f16() {
        let caps = DeviceCaps::synthetic(true, false, 0, 4 << 30);
        let id = auto_select(QuantClass::Q4K, "gemma2", &caps);
        assert_eq!(id, "gemma2-q4k-dequant-f16");
    }

    #[test]
    fn auto_select_scenario_3_q4k_safest() {
        let caps = DeviceCaps::synthetic(false, false, 0, 4 << 30);
        let id = auto_select(QuantClass::Q4K, "gemma3", &caps);
        assert_eq!(id, "gemma3-q4k-dequant-f32");
    }

    #[test]
    fn weight_ref_substitution_is_idempotent() {
        let resolved = resolve_weight_ref("blk.{L}.attn_q.weight", 7);
        assert_eq!(resolved, "blk.7.attn_q.weight");
        assert_eq!(resolve_weight_ref(&resolved, 3), resolved);
    }

    #[test]
    fn layer_override_applies_only_to_named_layer() {
        let path = sample_path("gemma2-q4k-fused");
        for l in [0usize, 11, 13, 99] {
            let steps = get_layer_steps(&path, l, Phase::Decode);
            assert_eq!(steps[0].kernel, "attn_a.wgsl");
        }
        let steps = get_layer_steps(&path, 12, Phase::Decode);
        assert_eq!(steps[0].kernel, "attn_b.wgsl");
    }

    #[test]
    fn prefill_falls_back_to_decode_when_absent() {
        let path = sample_path("gemma2-q4k-fused");
        let steps = get_layer_steps(&path, 0, Phase::Prefill);
        assert_eq!(steps[0].kernel, "attn_a.wgsl");
    }

    #[test]
    fn validate_rejects_empty_decode_block() {
        let mut path = sample_path("bad");
        path.decode.steps.clear();
        assert!(validate(&path).is_err());
    }

    fn q4k_manifest(family: &str) -> crate::storage::manifest::Manifest {
        use crate::storage::manifest::{ShardEntry, TensorEntry, WeightDtype};
        crate::storage::manifest::Manifest {
            model_id: format!("{family}-test-q4k"),
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 4,
            head_dim: 64,
            sliding_window: None,
            tensors: vec![TensorEntry {
                name: "blk.0.attn_q.weight".to_string(),
                shape: vec![256, 256],
                dtype: WeightDtype::Q4_0,
                shard_id: "shard-0".to_string(),
                byte_offset: 0,
                byte_length: 10,
            }],
            shards: vec![ShardEntry {
                id: "shard-0".to_string(),
                url: "https://example.invalid/shard-0.bin".to_string(),
                sha256: "a".repeat(64),
                byte_length: 10,
            }],
        }
    }

    #[test]
    fn builtin_table_auto_selects_for_known_family() {
        let table = PathTable::with_builtins();
        let manifest = q4k_manifest("gemma2");
        let caps = DeviceCaps::synthetic(true, true, 32, 4 << 30);
        let resolved = table.resolve(&manifest, "gemma2", None, &caps).unwrap();
        assert_eq!(resolved.path.id, "gemma2-q4k-fused");
    }

    #[test]
    fn builtin_table_falls_back_to_generic_alias_for_unknown_family() {
        let table = PathTable::with_builtins();
        let manifest = q4k_manifest("mistral");
        let caps = DeviceCaps::synthetic(false, false, 0, 4 << 30);
        let resolved = table.resolve(&manifest, "mistral", None, &caps).unwrap();
        assert_eq!(resolved.path.id, "q4k-dequant-f32");
    }

    #[test]
    fn builtin_table_covers_every_variant_for_every_family() {
        let table = PathTable::with_builtins();
        for family in BUILTIN_FAMILIES {
            for variant in BUILTIN_VARIANTS {
                let id = format!("{family}-{variant}");
                assert!(table.get(&id).is_some(), "missing built-in {id}");
            }
        }
        for variant in BUILTIN_VARIANTS {
            assert!(table.get(variant).is_some(), "missing generic alias {variant}");
        }
    }
}
