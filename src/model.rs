//! Interfaces to the surrounding model definition.
//!
//! The engine owns position encoding, KV caching, and attention; everything
//! weight-bearing (embeddings, per-layer projections, the vocabulary head)
//! is supplied by the caller through [`ModelAdapter`]. The adapter
//! is consulted once per step in the order `embed`, then per layer
//! `project_qkv` / `attention_output`, then `logits`.

use candle_core::Tensor;

use crate::error::Result;

/// Model hooks the decode loop drives.
///
/// Shapes use `b` = batch, `s` = step width (prompt length during prefill,
/// 1 during decode), `d` = model dimension, `h`/`h_kv` = query/kv head
/// counts, `hd` = head dimension.
pub trait ModelAdapter {
    /// Map token ids `[b, s]` to hidden states `[b, s, d]`.
    fn embed(&self, token_ids: &Tensor) -> Result<Tensor>;

    /// Project hidden states to per-head queries, keys, and values:
    /// `[b, s, d]` → (`[b, s, h, hd]`, `[b, s, h_kv, hd]`, `[b, s, h_kv, hd]`).
    ///
    /// Rotary encoding is applied by the engine afterwards; the adapter
    /// must return unrotated projections.
    fn project_qkv(&self, layer: usize, hidden: &Tensor) -> Result<(Tensor, Tensor, Tensor)>;

    /// Fold attention output `[b, s, h, hd]` back into the stream:
    /// output projection, residual connection, and whatever per-layer
    /// mixing (MLP, norms) the model does. Returns `[b, s, d]`.
    fn attention_output(&self, layer: usize, attn: &Tensor, residual: &Tensor) -> Result<Tensor>;

    /// Project final hidden states `[b, d]` to vocabulary logits
    /// `[b, vocab]`.
    fn logits(&self, hidden: &Tensor) -> Result<Tensor>;
}
