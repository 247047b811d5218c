//! Tiled online-softmax attention kernel.
//!
//! Computes the same function as the naive kernel without materializing the
//! `[seq_q, seq_kv]` score matrix: keys and values are processed in tiles
//! while per-row running statistics (max `m`, normalizer `l`) rescale the
//! accumulated output on the fly.
//!
//! ## Algorithm
//!
//! For each kv tile `j`:
//!   1. `S_j = Q @ K_jᵗ * scale + mask_j`
//!   2. `m_new = max(m, rowmax(S_j))`
//!   3. `P_j = exp(S_j - m_new)`
//!   4. `l = l * exp(m - m_new) + rowsum(P_j)`
//!   5. `O = O * exp(m - m_new) + P_j @ V_j`
//!   6. `m = m_new`
//!
//! and finally `O / l`. The running max is floored at a large negative
//! finite value so a tile whose every position is masked cannot poison the
//! statistics with `-inf - -inf`.
//!
//! References:
//! - FlashAttention: <https://arxiv.org/abs/2205.14135>
//! - FlashAttention-2: <https://arxiv.org/abs/2307.08691>

use candle_core::{Tensor, D};

use super::{check_group_size, repeat_kv, AttentionKernel};
use crate::error::Result;

/// Floor for the running row maximum. Any real score is far above this, and
/// flooring keeps `exp(s - m)` well-defined when a whole tile is masked.
const M_FLOOR: f32 = -1e30;

/// Online-softmax attention computed over fixed-size kv tiles.
#[derive(Debug, Clone, Copy)]
pub struct FusedKernel {
    /// Tile width along the key/value dimension.
    pub tile_size: usize,
}

impl Default for FusedKernel {
    fn default() -> Self {
        Self { tile_size: 64 }
    }
}

impl FusedKernel {
    /// Create a kernel with a custom tile width.
    pub fn with_tile_size(tile_size: usize) -> Self {
        Self {
            tile_size: tile_size.max(1),
        }
    }
}

impl AttentionKernel for FusedKernel {
    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq_q, num_heads, head_dim) = q.dims4()?;
        let (_, seq_kv, num_kv_heads, _) = k.dims4()?;
        let n_rep = check_group_size(num_heads, num_kv_heads)?;

        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        // [batch, num_heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let tile = self.tile_size.min(seq_kv).max(1);
        let num_tiles = seq_kv.div_ceil(tile);

        let device = q.device();
        let dtype = q.dtype();

        // Running statistics per query row.
        let mut m = Tensor::full(M_FLOOR, (batch, num_heads, seq_q), device)?.to_dtype(dtype)?;
        let mut l = Tensor::zeros((batch, num_heads, seq_q), dtype, device)?;
        let mut o = Tensor::zeros((batch, num_heads, seq_q, head_dim), dtype, device)?;

        for t in 0..num_tiles {
            let start = t * tile;
            let len = tile.min(seq_kv - start);

            let k_tile = k.narrow(2, start, len)?;
            let v_tile = v.narrow(2, start, len)?;

            // [batch, num_heads, seq_q, len]
            let scores = (q.matmul(&k_tile.transpose(D::Minus2, D::Minus1)?)? * scale)?;
            let scores = match mask {
                Some(mask) => scores.broadcast_add(&mask.narrow(D::Minus1, start, len)?)?,
                None => scores,
            };

            let tile_max = scores.max(D::Minus1)?;
            // Flooring makes m_new finite even for fully masked tiles.
            let m_new = m.maximum(&tile_max)?.maximum(M_FLOOR as f64)?;

            let p = scores.broadcast_sub(&m_new.unsqueeze(D::Minus1)?)?.exp()?;
            let row_sum = p.sum(D::Minus1)?;

            let alpha = (&m - &m_new)?.exp()?;
            l = ((&l * &alpha)? + row_sum)?;
            o = (o.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)? + p.matmul(&v_tile)?)?;
            m = m_new;
        }

        let out = o.broadcast_div(&l.unsqueeze(D::Minus1)?)?;

        Ok(out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_q, num_heads, head_dim))?)
    }
}
