//! Numeric stability guard (C9).
//!
//! Pure-Rust policies that are independently unit-testable without a GPU
//! device: max-subtracted softmax, finiteness detection, and the
//! widened-retry state machine the attention engine drives.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("poisoned prefill at layer {layer}: non-finite lane detected, no retry permitted for prefill")]
    PoisonedPrefill { layer: usize },

    #[error("poisoned decode at layer {layer} head {head} lane {lane}: widened retry also non-finite")]
    PoisonedDecode {
        layer: usize,
        head: usize,
        lane: usize,
    },
}

/// First-hit metadata captured when the finiteness probe trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonFiniteDiagnostic {
    pub layer: usize,
    pub head: usize,
    pub lane: usize,
}

/// Outcome of one finiteness-guarded write, per DESIGN NOTES: "exceptions-
/// for-control-flow in finiteness fallback" → explicit state machine instead
/// of throwing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardOutcome {
    Committed,
    WidenedCommitted(NonFiniteDiagnostic),
    Poisoned(NonFiniteDiagnostic),
}

/// Scan a tile of values for non-finite lanes, returning the first offending
/// lane index if any.
pub fn first_non_finite_lane(values: &[f32]) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

/// Drive the finiteness guard for one KV write attempt. `primary` is the
/// tile computed at the path's declared dtype; `widened` is produced lazily
/// by re-running the same step at F32 only if `primary` trips the guard.
pub fn guard_write(
    layer: usize,
    head: usize,
    primary: &[f32],
    widened: impl FnOnce() -> Vec<f32>,
) -> GuardOutcome {
    match first_non_finite_lane(primary) {
        None => GuardOutcome::Committed,
        Some(lane) => {
            let diag = NonFiniteDiagnostic { layer, head, lane };
            let widened_tile = widened();
            match first_non_finite_lane(&widened_tile) {
                None => GuardOutcome::WidenedCommitted(diag),
                Some(_) => GuardOutcome::Poisoned(diag),
            }
        }
    }
}

/// Optional per-score softcap: `s <- tanh(s/cap) * cap`, applied before the
/// max-subtracted softmax when the manifest declares one.
pub fn softcap(scores: &mut [f32], cap: f64) {
    let cap = cap as f32;
    for s in scores.iter_mut() {
        *s = (*s / cap).tanh() * cap;
    }
}

/// Max-subtracted softmax, accumulating the denominator in F32. Never
/// divides by zero: the max term always contributes `exp(0) = 1`.
pub fn softmax_max_subtracted(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let m = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - m).exp()).collect();
    let denom: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / denom).collect()
}

/// Query scaling: `1/sqrt(queryPreAttnScalar)` when the manifest supplies
/// one, otherwise `1/sqrt(head_dim)`. Both branches scale logits down by
/// the square root of the divisor, matching `matmul_affine_div(q, kT,
/// sqrt(query_pre_attn_scalar))`.
pub fn query_scalar(query_pre_attn_scalar: Option<f64>, head_dim: usize) -> f64 {
    let divisor = query_pre_attn_scalar.unwrap_or(head_dim as f64);
    1.0 / divisor.sqrt()
}
