//! Rotary position encoding.
//!
//! Position is encoded by rotating pairs of query/key coordinates through a
//! position-dependent angle `θ_i(p) = p · base^(-2i/d)`. Because the dot
//! product of two rotated vectors depends only on their position difference,
//! the cache can hold keys rotated at their *absolute* positions and a new
//! query rotated at its own absolute position attends correctly against
//! them, no matter where an entry physically sits in the ring buffer.
//!
//! The encoder is pure: cos/sin tables are precomputed at construction and
//! [`RotaryEncoder::apply`] is a function of (positions, tensors) only.
//! Prefill (many positions in one call) and single-token decode gather rows
//! from the same tables and run the same arithmetic, which is what makes
//! the two paths numerically identical.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Tensor, D};

use crate::config::RopeScaling;
use crate::error::{Error, Result};

/// Rotary position encoder with precomputed cos/sin tables.
#[derive(Debug, Clone)]
pub struct RotaryEncoder {
    /// Precomputed cosine values `[max_seq_len, head_dim]`.
    cos_cache: Tensor,
    /// Precomputed sine values `[max_seq_len, head_dim]`.
    sin_cache: Tensor,
    /// Head dimension (even).
    dim: usize,
    /// Number of precomputed positions.
    max_seq_len: usize,
}

impl RotaryEncoder {
    /// Build the encoder, precomputing tables for positions `0..max_seq_len`.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even)
    /// * `max_seq_len` - Number of positions to precompute
    /// * `theta` - Frequency base (10000 for most models)
    /// * `scaling` - Optional frequency scaling for extended context
    /// * `device` - Device to create the tables on
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `dim` is odd or zero.
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        scaling: RopeScaling,
        device: &Device,
    ) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(Error::Config(format!(
                "rotary dimension must be a positive even number, got {dim}"
            )));
        }

        // NTK-aware scaling stretches the base so low frequencies slow down
        // more than high ones.
        let theta = match scaling {
            RopeScaling::Ntk { factor } => {
                theta * f64::from(factor).powf(dim as f64 / (dim as f64 - 2.0))
            }
            _ => theta,
        };

        // Inverse frequencies: 1 / theta^(2i/dim) for pair index i.
        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?; // [dim/2]

        // Linear scaling divides positions, compressing the angle schedule.
        let position_scale = match scaling {
            RopeScaling::Linear { factor } => 1.0 / factor,
            _ => 1.0,
        };
        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32 * position_scale).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] angle table, duplicated across both halves so
        // the table row lines up with the split-half rotation below.
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos_cache = freqs.cos()?.to_dtype(DType::F32)?;
        let sin_cache = freqs.sin()?.to_dtype(DType::F32)?;

        Ok(Self {
            cos_cache,
            sin_cache,
            dim,
            max_seq_len,
        })
    }

    /// Returns the head dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the number of precomputed positions.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotate query and key tensors at explicit absolute positions.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor `[batch, seq, num_heads, head_dim]`
    /// * `k` - Key tensor `[batch, seq, num_kv_heads, head_dim]`
    /// * `positions` - Absolute position of each token, row-major over
    ///   `(batch, seq)`; must have `batch * seq` entries
    ///
    /// # Returns
    ///
    /// Rotated `(q, k)` with the input shapes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the position count does not match the
    /// tensor shapes or any position falls outside the precomputed table.
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _, _) = q.dims4()?;

        if positions.len() != batch * seq_len {
            return Err(Error::Config(format!(
                "expected {} positions for a [{batch}, {seq_len}] step, got {}",
                batch * seq_len,
                positions.len()
            )));
        }
        if let Some(&p) = positions.iter().find(|&&p| p >= self.max_seq_len) {
            return Err(Error::Config(format!(
                "position {p} outside precomputed range 0..{}",
                self.max_seq_len
            )));
        }

        // Gather the table rows for these positions: [batch * seq, dim],
        // then shape for broadcasting over the head axis.
        let idx: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
        let idx = Tensor::new(idx.as_slice(), self.cos_cache.device())?;
        let cos = self
            .cos_cache
            .index_select(&idx, 0)?
            .reshape((batch, seq_len, 1, self.dim))?;
        let sin = self
            .sin_cache
            .index_select(&idx, 0)?
            .reshape((batch, seq_len, 1, self.dim))?;

        let q_rot = rotate(q, &cos, &sin)?;
        let k_rot = rotate(k, &cos, &sin)?;
        Ok((q_rot, k_rot))
    }
}

/// `x * cos + rotate_half(x) * sin`.
fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let x_cos = x.broadcast_mul(cos)?;
    let x_sin = rotate_half(x)?.broadcast_mul(sin)?;
    Ok(x_cos.add(&x_sin)?)
}

/// For input `[a, b]` halves, produces `[-b, a]`: each (split-half) pair is
/// rotated by 90 degrees.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let dim = x.dim(D::Minus1)?;
    let half = dim / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], last)?)
}
