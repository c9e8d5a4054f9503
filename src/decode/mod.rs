//! Decode loop / sampler gateway (C11).
//!
//! `Idle -> Prefilling -> Decoding -> (Idle | Failed)`: prompt in, `mpsc`
//! token stream out, `tokio::spawn`-driven loop, generalized from a single
//! fixed pipeline into one that drives the layer runner through a resolved
//! kernel path and surfaces `DopplerError` instead of a string.

pub mod signals;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DopplerError;
use crate::numeric::GuardError;

pub type TokenId = u32;

/// Opaque callback the host supplies to turn logits into the next token,
/// treated as an external collaborator rather than something this crate
/// implements; `async` because a real sampler gateway is itself a
/// suspension point (host round-trip, possibly off-thread top-k/top-p).
#[async_trait]
pub trait SamplerGateway: Send {
    async fn sample(&mut self, logits: &[f32]) -> TokenId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Prefilling,
    Decoding,
    Failed,
}

#[derive(Debug, Clone)]
pub enum DecodeEvent {
    Token { token_id: TokenId, position: usize },
    Done { total_tokens: usize },
    Error(String),
}

pub struct GenerationRequest {
    pub request_id: String,
    pub prompt_tokens: Vec<TokenId>,
    pub max_tokens: usize,
    pub eos_token: Option<TokenId>,
}

impl GenerationRequest {
    /// Build a request with a fresh random id via `uuid::Uuid::new_v4` for
    /// request correlation.
    pub fn new(prompt_tokens: Vec<TokenId>, max_tokens: usize, eos_token: Option<TokenId>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            prompt_tokens,
            max_tokens,
            eos_token,
        }
    }
}

/// Drives one request's prefill + decode loop. Each call to `step` advances
/// exactly one token (or runs the whole prefill) and returns the new state;
/// callers own the suspension points (GPU readback, shard fetch, sampler
/// callback) by awaiting between calls.
pub struct DecodeContext {
    state: DecodeState,
    current_seq_len: usize,
    cancelled: bool,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            current_seq_len: 0,
            cancelled: false,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Request cancellation; the next suspension point resolves with
    /// `Cancelled` and the KV cache is left in its last committed state.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn check_cancelled(&self) -> Result<(), DopplerError> {
        if self.cancelled {
            return Err(DopplerError::Cancelled);
        }
        Ok(())
    }

    /// Ingest the full prompt in one batched pass, populating KV for
    /// `[0, promptLen)`. On success, transitions to `Decoding`.
    pub fn prefill(
        &mut self,
        prompt_len: usize,
        run_layers: impl FnOnce(usize) -> Result<(), GuardError>,
    ) -> Result<(), DopplerError> {
        self.check_cancelled()?;
        self.state = DecodeState::Prefilling;

        match run_layers(prompt_len) {
            Ok(()) => {
                self.current_seq_len = prompt_len;
                self.state = DecodeState::Decoding;
                info!(prompt_len, "prefill complete");
                Ok(())
            }
            Err(_guard_err) => {
                self.state = DecodeState::Failed;
                // Prefill failures are always fatal: no widened-precision
                // retry for prefill (Open Question, decided in DESIGN.md).
                Err(DopplerError::Guard(GuardError::PoisonedPrefill { layer: 0 }))
            }
        }
    }

    /// Advance one decode step: produce logits for the current position,
    /// delegate to the sampler, append the sampled token, advance the
    /// cursor. On `PoisonedDecode`, transitions to `Failed`.
    pub async fn decode_step(
        &mut self,
        run_layer_step: impl FnOnce(usize) -> Result<Vec<f32>, DopplerError>,
        sampler: &mut dyn SamplerGateway,
    ) -> Result<TokenId, DopplerError> {
        self.check_cancelled()?;
        if self.state != DecodeState::Decoding {
            return Err(DopplerError::ConfigViolation(
                "decode_step called outside Decoding state".to_string(),
            ));
        }

        let logits = match run_layer_step(self.current_seq_len) {
            Ok(logits) => logits,
            Err(e @ DopplerError::Guard(GuardError::PoisonedDecode { .. })) => {
                self.state = DecodeState::Failed;
                warn!("decode poisoned, tearing down context");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let token = sampler.sample(&logits).await;
        self.current_seq_len += 1;
        Ok(token)
    }

    pub fn current_seq_len(&self) -> usize {
        self.current_seq_len
    }
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a full request end to end, emitting one `DecodeEvent` per generated
/// token over the returned channel, terminating with exactly one `Done` or
/// `Error`.
pub async fn run_request<S: SamplerGateway + 'static>(
    request: GenerationRequest,
    mut ctx: DecodeContext,
    mut run_layer_step: impl FnMut(usize) -> Result<Vec<f32>, DopplerError> + Send + 'static,
    mut sampler: S,
) -> mpsc::Receiver<DecodeEvent> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let prompt_len = request.prompt_tokens.len();
        if let Err(e) = ctx.prefill(prompt_len, |_| Ok(())) {
            let _ = tx.send(DecodeEvent::Error(e.to_string())).await;
            let _ = tx
                .send(DecodeEvent::Done {
                    total_tokens: prompt_len,
                })
                .await;
            return;
        }

        let mut generated = 0;
        for _ in 0..request.max_tokens {
            match ctx.decode_step(&mut run_layer_step, &mut sampler).await {
                Ok(token_id) => {
                    generated += 1;
                    let position = ctx.current_seq_len();
                    if tx
                        .send(DecodeEvent::Token { token_id, position })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if Some(token_id) == request.eos_token {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(DecodeEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }

        let _ = tx
            .send(DecodeEvent::Done {
                total_tokens: prompt_len + generated,
            })
            .await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    struct GreedySampler;
    #[async_trait]
    impl SamplerGateway for GreedySampler {
        async fn sample(&mut self, logits: &[f32]) -> TokenId {
            logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i as TokenId)
                .unwrap_or(0)
        }
    }

    #[test]
    fn cancel_surfaces_before_any_prefill() {
        let mut ctx = DecodeContext::new();
        ctx.cancel();
        let result = ctx.prefill(4, |_| Ok(()));
        assert!(matches!(result, Err(DopplerError::Cancelled)));
    }

    #[tokio::test]
    async fn prefill_then_decode_advances_state() {
        let mut ctx = DecodeContext::new();
        ctx.prefill(3, |_| Ok(())).unwrap();
        assert_eq!(ctx.state(), DecodeState::Decoding);

        let mut sampler = GreedySampler;
        let token = ctx
            .decode_step(|_pos| Ok(vec![0.1, 0.9, 0.2]), &mut sampler)
            .await
            .unwrap();
        assert_eq!(token, 1);
        assert_eq!(ctx.current_seq_len(), 4);
    }

    #[tokio::test]
    async fn poisoned_decode_transitions_to_failed() {
        let mut ctx = DecodeContext::new();
        ctx.prefill(1, |_| Ok(())).unwrap();
        let mut sampler = GreedySampler;
        let result = ctx
            .decode_step(
                |_pos| {
                    Err(DopplerError::Guard(GuardError::PoisonedDecode {
                        layer: 2,
                        head: 0,
                        lane: 1,
                    }))
                },
                &mut sampler,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(ctx.state(), DecodeState::Failed);
    }

    #[tokio::test]
    async fn run_request_emits_done_exactly_once() {
        let request = GenerationRequest::new(vec![1, 2, 3], 4, None);
        let ctx = DecodeContext::new();
        let mut rx = run_request(
            request,
            ctx,
            |_pos| Ok(vec![0.1, 0.5, 0.2]),
            GreedySampler,
        )
        .await;

        let mut done_count = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, DecodeEvent::Done { .. }) {
                done_count += 1;
            }
        }
        assert_eq!(done_count, 1);
    }
}
