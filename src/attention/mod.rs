//! Attention engine (C8): orchestrates the ten-step per-layer attention
//! sequence on top of the KV cache, numeric guard, and kernel path.
//!
//! The actual per-step GPU dispatch (matmul, RoPE, softmax kernels) is
//! issued through `wgpu` command encoders the layer runner owns; this module
//! is the pure sequencing and host-side bookkeeping layer above that,
//! keeping orchestration and actual compute in separate modules the way an
//! `InferenceEngine`/`llama_ffi` split would.

use std::collections::HashMap;

use crate::error::DopplerError;
use crate::kernel::path::{KernelPath, Step};
use crate::kernel::resolver::{get_layer_steps, KernelPathError, Phase, PathTable};
use crate::kv_cache::KvCache;
use crate::numeric::{guard_write, query_scalar, softcap, softmax_max_subtracted, GuardOutcome};

/// Per-layer attention hyperparameters pulled from the manifest.
#[derive(Debug, Clone, Copy)]
pub struct AttentionParams {
    pub head_dim: usize,
    pub query_pre_attn_scalar: Option<f64>,
    pub attn_logit_softcapping: Option<f64>,
    pub sliding_window: Option<usize>,
}

/// Host-side record of one layer's attention step outcome, surfaced to the
/// decode loop for logging and for a widened-retry scenario.
#[derive(Debug, Clone, Copy)]
pub struct AttentionStepReport {
    pub layer: usize,
    pub position: usize,
    pub guard_outcome: GuardOutcome,
}

/// Run one position's worth of attention for one layer: RoPE is assumed
/// already applied to `q`/`k` by the caller (the path's RoPE step runs
/// before this call); this function covers the KV write (guarded), score
/// computation, optional softcap, max-subtracted softmax, and the P·V
/// reduction, expressed over host-resident `f32` slices so the policy is
/// testable without a device.
pub fn attend_one_position(
    kv: &mut KvCache,
    layer: usize,
    position: usize,
    q: &[f32],
    k_new: &[f32],
    v_new: &[f32],
    k_history: &[Vec<f32>],
    v_history: &[Vec<f32>],
    params: &AttentionParams,
) -> Result<(Vec<f32>, AttentionStepReport), DopplerError> {
    let outcome = guard_write(layer, 0, k_new, || k_new.iter().map(|x| *x as f64 as f32).collect());

    match outcome {
        GuardOutcome::Poisoned(diag) => {
            return Err(DopplerError::Guard(crate::numeric::GuardError::PoisonedDecode {
                layer: diag.layer,
                head: diag.head,
                lane: diag.lane,
            }));
        }
        GuardOutcome::Committed | GuardOutcome::WidenedCommitted(_) => {
            kv.record_write(layer, position)?;
        }
    }

    let layer_kv = kv.layer(layer)?;
    let scalar = query_scalar(params.query_pre_attn_scalar, params.head_dim) as f32;

    let mut scores = Vec::with_capacity(position + 1);
    for key_pos in 0..=position {
        if !layer_kv.is_visible(position, key_pos) {
            continue;
        }
        let k_vec = if key_pos == position {
            k_new
        } else {
            &k_history[key_pos]
        };
        let dot: f32 = q.iter().zip(k_vec).map(|(a, b)| a * b).sum();
        scores.push(dot * scalar);
    }

    if let Some(cap) = params.attn_logit_softcapping {
        softcap(&mut scores, cap);
    }

    let probs = softmax_max_subtracted(&scores);

    let mut context = vec![0.0_f32; v_new.len()];
    let mut visible_positions = (0..=position).filter(|&kp| layer_kv.is_visible(position, kp));
    for (p, key_pos) in probs.iter().zip(visible_positions.by_ref()) {
        let v_vec = if key_pos == position { v_new } else { &v_history[key_pos] };
        for (c, v) in context.iter_mut().zip(v_vec) {
            *c += p * v;
        }
    }

    Ok((
        context,
        AttentionStepReport {
            layer,
            position,
            guard_outcome: outcome,
        },
    ))
}

/// A logical matmul site in the per-layer sequence. Resolved to a concrete
/// step (and from there to a variant name) by `lookup_matmul_role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatmulRole {
    QProj,
    KProj,
    VProj,
    QkvProj,
    OProj,
    FfnGate,
    FfnUp,
    FfnDown,
    FfnGateUp,
    LmHead,
}

impl MatmulRole {
    /// Step ops this role accepts, in priority order. A fused projection
    /// step satisfies every individual role it subsumes: `qkv_proj` covers
    /// `q_proj`/`k_proj`/`v_proj`, and if no fused `qkv_proj` step is
    /// declared the role `qkv_proj` itself falls through to the split
    /// `q_proj` step as its representative. `ffn_gate_up` is the FFN
    /// analogue of the same fuse-or-split choice.
    fn alias_ops(self) -> &'static [&'static str] {
        match self {
            MatmulRole::QProj => &["q_proj", "qkv_proj"],
            MatmulRole::KProj => &["k_proj", "qkv_proj"],
            MatmulRole::VProj => &["v_proj", "qkv_proj"],
            MatmulRole::QkvProj => &["qkv_proj", "q_proj"],
            MatmulRole::OProj => &["o_proj"],
            MatmulRole::FfnGate => &["ffn_gate", "ffn_gate_up"],
            MatmulRole::FfnUp => &["ffn_up", "ffn_gate_up"],
            MatmulRole::FfnDown => &["ffn_down"],
            MatmulRole::FfnGateUp => &["ffn_gate_up", "ffn_gate"],
            MatmulRole::LmHead => &["lm_head"],
        }
    }

    /// `lm_head` lives in the postLayer block regardless of the requested
    /// phase; every other role follows normal phase/layer-override
    /// resolution.
    fn lives_in_post_layer(self) -> bool {
        matches!(self, MatmulRole::LmHead)
    }
}

fn find_role_step(path: &KernelPath, role: MatmulRole, phase: Phase, layer_index: usize) -> Option<Step> {
    let steps = if role.lives_in_post_layer() {
        path.post_layer.as_ref()?.steps.clone()
    } else {
        get_layer_steps(path, layer_index, phase)
    };
    let aliases = role.alias_ops();
    steps.into_iter().find(|step| aliases.contains(&step.op.as_str()))
}

/// Reverse index from a step's `(kernel, entry)` back to the registered
/// variant id(s) declaring it, built once from a `PathTable`. Turns "this
/// role ran kernel X entry Y" into a human-readable variant name instead of
/// a bare shader filename.
#[derive(Debug, Default)]
pub struct KernelVariantTable {
    owners: HashMap<(String, String), Vec<String>>,
}

impl KernelVariantTable {
    pub fn from_path_table(table: &PathTable) -> Self {
        let mut owners: HashMap<(String, String), Vec<String>> = HashMap::new();
        for (id, path) in table.iter() {
            let blocks = path
                .decode
                .steps
                .iter()
                .chain(path.prefill.iter().flat_map(|b| b.steps.iter()))
                .chain(path.pre_layer.iter().flat_map(|b| b.steps.iter()))
                .chain(path.post_layer.iter().flat_map(|b| b.steps.iter()))
                .chain(path.sampling.iter().flat_map(|b| b.steps.iter()))
                .chain(path.layer_overrides.iter().flat_map(|o| o.steps.values()));
            for step in blocks {
                owners
                    .entry((step.kernel.clone(), step.entry.clone()))
                    .or_default()
                    .push(id.clone());
            }
        }
        for ids in owners.values_mut() {
            ids.sort();
            ids.dedup();
        }
        Self { owners }
    }

    /// The variant id owning `(kernel, entry)`, if exactly one registered
    /// variant declares it. A kernel shared across many variants (a generic
    /// shader reused by several roles) or one not registered at all resolves
    /// to `None` — ambiguous either way from the caller's perspective, and
    /// the single-owner case covers the "shared shader" fallback: if only
    /// one variant happens to use that shader, it's returned unambiguously.
    pub fn lookup(&self, kernel: &str, entry: &str) -> Option<&str> {
        match self.owners.get(&(kernel.to_string(), entry.to_string()))?.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }
}

/// Resolve `role` at `phase`/`layer_index` to a variant name. When `strict`
/// is true (the active path came from an explicit source, not
/// auto-selection) and the variant table can't attribute the resolved step
/// to exactly one registered variant, this refuses the silent fallback
/// instead of guessing.
pub fn lookup_matmul_role(
    path: &KernelPath,
    variants: &KernelVariantTable,
    role: MatmulRole,
    phase: Phase,
    layer_index: usize,
    strict: bool,
) -> Result<String, KernelPathError> {
    let step = find_role_step(path, role, phase, layer_index).ok_or_else(|| KernelPathError::UnknownMatmulRole {
        path_id: path.id.clone(),
        role,
        phase,
    })?;

    match variants.lookup(&step.kernel, &step.entry) {
        Some(variant) => Ok(variant.to_string()),
        None if strict => Err(KernelPathError::SilentFallbackRefused {
            role,
            kernel: step.kernel.clone(),
            entry: step.entry.clone(),
        }),
        None => Ok(format!("{}#{}", step.kernel, step.entry)),
    }
}

#[cfg(test)]
fn test_step(op: &str, kernel: &str, entry: &str) -> Step {
    Step {
        op: op.to_string(),
        kernel: kernel.to_string(),
        entry: entry.to_string(),
        inputs: vec![],
        outputs: vec![],
        weight_refs: vec![],
        constants: HashMap::new(),
        compute: crate::kernel::path::ComputeDtype::Mixed,
    }
}

#[cfg(test)]
mod role_lookup_tests {
    use super::*;
    use crate::kernel::path::{LayerOverride, StepBlock};

    fn path_with_steps(id: &str, decode: Vec<Step>, post_layer: Option<Vec<Step>>) -> KernelPath {
        KernelPath {
            id: id.to_string(),
            name: id.to_string(),
            decode: StepBlock { steps: decode },
            prefill: None,
            pre_layer: None,
            post_layer: post_layer.map(|steps| StepBlock { steps }),
            sampling: None,
            layer_overrides: vec![],
        }
    }

    #[test]
    fn qkv_proj_role_falls_through_to_q_proj_when_unfused() {
        let path = path_with_steps(
            "split",
            vec![
                test_step("q_proj", "qproj.wgsl", "main"),
                test_step("k_proj", "kproj.wgsl", "main"),
            ],
            None,
        );
        let step = find_role_step(&path, MatmulRole::QkvProj, Phase::Decode, 0).unwrap();
        assert_eq!(step.kernel, "qproj.wgsl");
    }

    #[test]
    fn individual_projection_role_matches_fused_qkv_step() {
        let path = path_with_steps(
            "fused",
            vec![test_step("qkv_proj", "qkv_fused.wgsl", "main")],
            None,
        );
        let step = find_role_step(&path, MatmulRole::VProj, Phase::Decode, 0).unwrap();
        assert_eq!(step.kernel, "qkv_fused.wgsl");
    }

    #[test]
    fn lm_head_only_looks_in_post_layer_block() {
        let path = path_with_steps(
            "withhead",
            vec![test_step("lm_head", "wrong_block.wgsl", "main")],
            Some(vec![test_step("lm_head", "lm_head.wgsl", "main")]),
        );
        let step = find_role_step(&path, MatmulRole::LmHead, Phase::Decode, 0).unwrap();
        assert_eq!(step.kernel, "lm_head.wgsl");
    }

    #[test]
    fn lm_head_absent_without_post_layer_block() {
        let path = path_with_steps("nohead", vec![test_step("lm_head", "decoy.wgsl", "main")], None);
        assert!(find_role_step(&path, MatmulRole::LmHead, Phase::Decode, 0).is_none());
    }

    #[test]
    fn layer_override_is_honored_by_role_lookup() {
        let mut path = path_with_steps("ov", vec![test_step("o_proj", "o_default.wgsl", "main")], None);
        path.layer_overrides.push(LayerOverride {
            layers: vec![5],
            steps: HashMap::from([("o_proj".to_string(), test_step("o_proj", "o_layer5.wgsl", "main"))]),
        });
        let default = find_role_step(&path, MatmulRole::OProj, Phase::Decode, 0).unwrap();
        assert_eq!(default.kernel, "o_default.wgsl");
        let overridden = find_role_step(&path, MatmulRole::OProj, Phase::Decode, 5).unwrap();
        assert_eq!(overridden.kernel, "o_layer5.wgsl");
    }

    #[test]
    fn variant_table_resolves_unique_owner() {
        let mut table = PathTable::new();
        table
            .register(path_with_steps(
                "gemma2-q4k-fused",
                vec![test_step("q_proj", "matmul_q4k.wgsl", "main")],
                None,
            ))
            .unwrap();
        let variants = KernelVariantTable::from_path_table(&table);
        assert_eq!(variants.lookup("matmul_q4k.wgsl", "main"), Some("gemma2-q4k-fused"));
    }

    #[test]
    fn variant_table_is_ambiguous_when_multiple_variants_share_a_shader() {
        let mut table = PathTable::new();
        table
            .register(path_with_steps(
                "variant-a",
                vec![test_step("q_proj", "shared.wgsl", "main")],
                None,
            ))
            .unwrap();
        table
            .register(path_with_steps(
                "variant-b",
                vec![test_step("q_proj", "shared.wgsl", "main")],
                None,
            ))
            .unwrap();
        let variants = KernelVariantTable::from_path_table(&table);
        assert_eq!(variants.lookup("shared.wgsl", "main"), None);
    }

    #[test]
    fn lookup_matmul_role_non_strict_falls_back_to_kernel_entry_name() {
        let path = path_with_steps("unregistered", vec![test_step("o_proj", "o.wgsl", "main")], None);
        let variants = KernelVariantTable::default();
        let name = lookup_matmul_role(&path, &variants, MatmulRole::OProj, Phase::Decode, 0, false).unwrap();
        assert_eq!(name, "o.wgsl#main");
    }

    #[test]
    fn lookup_matmul_role_strict_refuses_silent_fallback() {
        let path = path_with_steps("unregistered", vec![test_step("o_proj", "o.wgsl", "main")], None);
        let variants = KernelVariantTable::default();
        let result = lookup_matmul_role(&path, &variants, MatmulRole::OProj, Phase::Decode, 0, true);
        assert!(matches!(
            result,
            Err(KernelPathError::SilentFallbackRefused { .. })
        ));
    }

    #[test]
    fn lookup_matmul_role_strict_succeeds_when_variant_is_unambiguous() {
        let mut table = PathTable::new();
        table
            .register(path_with_steps(
                "gemma2-q4k-fused",
                vec![test_step("o_proj", "matmul_q4k.wgsl", "main")],
                None,
            ))
            .unwrap();
        let variants = KernelVariantTable::from_path_table(&table);
        let path = table.get("gemma2-q4k-fused").unwrap();
        let name = lookup_matmul_role(path, &variants, MatmulRole::OProj, Phase::Decode, 0, true).unwrap();
        assert_eq!(name, "gemma2-q4k-fused");
    }
}
