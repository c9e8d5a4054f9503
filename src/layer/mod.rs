//! Layer runner (C10): pre-norm -> attention -> residual -> FFN -> residual.
//!
//! RMSNorm and the FFN activation widen internally to F32 and narrow back
//! only at the step boundary, the same split `RmsNorm::forward` draws in the
//! Gemma2 reference implementation this is grounded on: reduction-heavy ops
//! always accumulate in F32 regardless of the path's declared activation
//! dtype.

/// Activation function for the FFN's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnActivation {
    Silu,
    SwiGlu,
    Gelu,
}

/// RMSNorm over a single row, computed in F32 regardless of the nominal
/// storage dtype of `x` and `weight`.
pub fn rms_norm(x: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
    let n = x.len() as f32;
    let mean_sq: f32 = x.iter().map(|v| v * v).sum::<f32>() / n;
    let scale = 1.0 / (mean_sq + eps).sqrt();
    x.iter()
        .zip(weight)
        .map(|(v, w)| v * scale * (1.0 + w))
        .collect()
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))).tanh())
}

/// Gated FFN: `down(act(gate(x)) * up(x))`. `gate_proj`/`up_proj` are
/// assumed already computed by the path's matmul steps; this function is
/// the activation + elementwise-gate stage between them, always F32 per
/// the reduction-heavy widening rule.
pub fn ffn_activate(gate_proj: &[f32], up_proj: &[f32], activation: FfnActivation) -> Vec<f32> {
    gate_proj
        .iter()
        .zip(up_proj)
        .map(|(&g, &u)| {
            let act = match activation {
                FfnActivation::Silu | FfnActivation::SwiGlu => silu(g),
                FfnActivation::Gelu => gelu(g),
            };
            act * u
        })
        .collect()
}

/// Elementwise residual add, F32 accumulation.
pub fn residual_add(x: &[f32], residual: &[f32]) -> Vec<f32> {
    x.iter().zip(residual).map(|(a, b)| a + b).collect()
}

/// Whether this layer applies a sliding-window mask, per the Gemma2-style
/// alternating-layer convention (`layer_idx % 2 != 0` => sliding window) —
/// used only as the default when the manifest doesn't declare a per-layer
/// schedule explicitly.
pub fn default_uses_sliding_window(layer_idx: usize) -> bool {
    layer_idx % 2 != 0
}
