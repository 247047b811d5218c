//! Attention kernels.
//!
//! One [`AttentionKernel`] contract, two interchangeable strategies:
//!
//! - [`NaiveKernel`](naive::NaiveKernel) materializes the full score matrix
//!   and is the reference implementation.
//! - [`FusedKernel`](fused::FusedKernel) computes the same function tile by
//!   tile with an online softmax and never materializes the score matrix.
//!
//! Both are pure functions of their inputs and must agree within
//! floating-point tolerance; the equivalence is covered by tests. Masking
//! is fully caller-driven: the scheduler supplies an additive mask (`0` for
//! visible positions, `-inf` for masked ones) and the kernels apply it as
//! a bias, so the same kernels serve prefill (causal mask) and decode
//! (cache-validity mask).

pub mod fused;
pub mod naive;

use candle_core::Tensor;

pub use fused::FusedKernel;
pub use naive::NaiveKernel;

use crate::config::KernelKind;
use crate::error::{Error, Result};

/// Scaled dot-product attention over a key/value view.
///
/// Inputs:
/// - `q`: `[batch, seq_q, num_query_heads, head_dim]`
/// - `k`, `v`: `[batch, seq_kv, num_kv_heads, head_dim]`
/// - `mask`: additive bias broadcastable to `[batch, 1, seq_q, seq_kv]`
///
/// Output: `[batch, seq_q, num_query_heads, head_dim]`.
///
/// Grouped-query attention is handled inside the kernel: query head `h`
/// attends with kv head `h / (num_query_heads / num_kv_heads)`.
pub trait AttentionKernel: std::fmt::Debug + Send + Sync {
    /// Compute `softmax(Q·Kᵗ / sqrt(head_dim) + mask) · V`.
    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor>;
}

/// Build the kernel selected by configuration.
pub fn build_kernel(kind: KernelKind) -> Box<dyn AttentionKernel> {
    match kind {
        KernelKind::Naive => Box::new(NaiveKernel),
        KernelKind::Fused => Box::new(FusedKernel::default()),
    }
}

/// Check the grouped-query head ratio and return the group size.
pub(crate) fn check_group_size(num_query_heads: usize, num_kv_heads: usize) -> Result<usize> {
    if num_kv_heads == 0 || num_query_heads % num_kv_heads != 0 {
        return Err(Error::Config(format!(
            "num_query_heads ({num_query_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
        )));
    }
    Ok(num_query_heads / num_kv_heads)
}

/// Repeat KV heads so each query head lines up with its shared KV head.
///
/// Input `[batch, seq, num_kv_heads, head_dim]`, output
/// `[batch, seq, num_kv_heads * n_rep, head_dim]`. Query heads
/// `g * n_rep .. (g + 1) * n_rep` all see kv head `g`.
pub(crate) fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, seq_len, num_kv_heads, head_dim) = x.dims4()?;
    let x = x.unsqueeze(3)?;
    let x = x.expand((batch, seq_len, num_kv_heads, n_rep, head_dim))?;
    Ok(x.reshape((batch, seq_len, num_kv_heads * n_rep, head_dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_check_group_size() {
        assert_eq!(check_group_size(8, 2).unwrap(), 4);
        assert_eq!(check_group_size(4, 4).unwrap(), 1);
        assert!(check_group_size(8, 3).is_err());
        assert!(check_group_size(8, 0).is_err());
    }

    #[test]
    fn test_repeat_kv_layout() {
        let device = Device::Cpu;
        // kv head 0 all zeros, kv head 1 all ones.
        let data: Vec<f32> = vec![0.0, 0.0, 1.0, 1.0];
        let x = Tensor::from_vec(data, (1, 1, 2, 2), &device).unwrap();

        let out = repeat_kv(&x, 3).unwrap();
        assert_eq!(out.dims(), &[1, 1, 6, 2]);

        let flat: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        // Heads 0-2 from kv head 0, heads 3-5 from kv head 1.
        assert_eq!(flat, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
    }
}
