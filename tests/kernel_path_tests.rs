//! End-to-end kernel-path resolution scenarios.

use std::collections::HashMap;

use doppler_infer_core::device::DeviceCaps;
use doppler_infer_core::kernel::path::{ComputeDtype, KernelPath, LayerOverride, Step, StepBlock};
use doppler_infer_core::kernel::resolver::{
    auto_select, get_layer_steps, quant_class_of, Phase, PathTable, QuantClass,
};
use doppler_infer_core::storage::manifest::{Manifest, ShardEntry, TensorEntry, WeightDtype};

fn attention_step(kernel: &str) -> Step {
    Step {
        op: "attention".to_string(),
        kernel: kernel.to_string(),
        entry: "main".to_string(),
        inputs: vec![],
        outputs: vec![],
        weight_refs: vec![],
        constants: HashMap::new(),
        compute: ComputeDtype::Mixed,
    }
}

fn gemma2_path(id: &str) -> KernelPath {
    KernelPath {
        id: id.to_string(),
        name: id.to_string(),
        decode: StepBlock {
            steps: vec![attention_step("variant_a.wgsl")],
        },
        prefill: None,
        pre_layer: None,
        post_layer: None,
        sampling: None,
        layer_overrides: vec![LayerOverride {
            layers: vec![12],
            steps: HashMap::from([(
                "attention".to_string(),
                attention_step("variant_b.wgsl"),
            )]),
        }],
    }
}

fn q4k_manifest() -> Manifest {
    Manifest {
        model_id: "gemma2-9b-q4k".to_string(),
        n_layers: 42,
        n_heads: 16,
        n_kv_heads: 8,
        head_dim: 256,
        sliding_window: Some(4096),
        tensors: vec![TensorEntry {
            name: "blk.0.attn_q.weight".to_string(),
            shape: vec![4096, 4096],
            dtype: WeightDtype::Q4_0,
            shard_id: "shard-0".to_string(),
            byte_offset: 0,
            byte_length: 100,
        }],
        shards: vec![ShardEntry {
            id: "shard-0".to_string(),
            url: "https://example.invalid/shard-0.bin".to_string(),
            sha256: "a".repeat(64),
            byte_length: 100,
        }],
    }
}

#[test]
fn scenario_1_q4k_subgroups_and_f16() {
    let manifest = q4k_manifest();
    let caps = DeviceCaps::synthetic(true, true, 32, 8 << 30);
    let quant = quant_class_of(&manifest);
    assert_eq!(quant, QuantClass::Q4K);
    assert_eq!(auto_select(quant, "gemma2", &caps), "gemma2-q4k-fused");
}

#[test]
fn scenario_2_q4k_no_subgroups_f16_available() {
    let manifest = q4k_manifest();
    let caps = DeviceCaps::synthetic(true, false, 0, 8 << 30);
    let quant = quant_class_of(&manifest);
    assert_eq!(
        auto_select(quant, "gemma2", &caps),
        "gemma2-q4k-dequant-f16"
    );
}

#[test]
fn scenario_3_q4k_safest_fallback() {
    let mut manifest = q4k_manifest();
    manifest.model_id = "gemma3-27b-q4k".to_string();
    let caps = DeviceCaps::synthetic(false, false, 0, 8 << 30);
    let quant = quant_class_of(&manifest);
    assert_eq!(
        auto_select(quant, "gemma3", &caps),
        "gemma3-q4k-dequant-f32"
    );
}

#[test]
fn scenario_6_layer_override_applies_only_to_named_layer() {
    let path = gemma2_path("gemma2-q4k-fused");

    for l in [0usize, 11, 13, 41] {
        let steps = get_layer_steps(&path, l, Phase::Decode);
        assert_eq!(steps[0].kernel, "variant_a.wgsl", "layer {l}");
    }

    let steps = get_layer_steps(&path, 12, Phase::Decode);
    assert_eq!(steps[0].kernel, "variant_b.wgsl");
}

#[test]
fn resolve_through_path_table_with_runtime_override() {
    let mut table = PathTable::new();
    table.register(gemma2_path("gemma2-q4k-fused")).unwrap();
    table
        .register(gemma2_path("gemma2-custom"))
        .unwrap();

    let manifest = q4k_manifest();
    let caps = DeviceCaps::synthetic(true, true, 32, 8 << 30);

    let resolved = table
        .resolve(&manifest, "gemma2", Some("gemma2-custom"), &caps)
        .unwrap();
    assert_eq!(resolved.path.id, "gemma2-custom");

    let auto_resolved = table.resolve(&manifest, "gemma2", None, &caps).unwrap();
    assert_eq!(auto_resolved.path.id, "gemma2-q4k-fused");
}

#[test]
fn resolve_fails_for_unregistered_override() {
    let table = PathTable::new();
    let manifest = q4k_manifest();
    let caps = DeviceCaps::synthetic(true, true, 32, 8 << 30);
    let result = table.resolve(&manifest, "gemma2", Some("does-not-exist"), &caps);
    assert!(result.is_err());
}
