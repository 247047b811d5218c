//! Reference attention kernel.

use candle_core::{Tensor, D};

use super::{check_group_size, repeat_kv, AttentionKernel};
use crate::error::Result;

/// Materializes the full `[seq_q, seq_kv]` score matrix per head.
///
/// Softmax runs through `softmax_last_dim`, which subtracts the per-row
/// maximum before exponentiating, so masked `-inf` entries contribute
/// exactly zero weight without overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveKernel;

impl AttentionKernel for NaiveKernel {
    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq_q, num_heads, head_dim) = q.dims4()?;
        let (_, _, num_kv_heads, _) = k.dims4()?;
        let n_rep = check_group_size(num_heads, num_kv_heads)?;

        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        // [batch, num_heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * scale)?;

        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?;

        // Back to [batch, seq_q, num_heads, head_dim].
        Ok(out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_q, num_heads, head_dim))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_output_shape() {
        let device = Device::Cpu;
        let q = Tensor::randn(0.0f32, 1.0, (2, 3, 4, 8), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (2, 5, 2, 8), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (2, 5, 2, 8), &device).unwrap();

        let out = NaiveKernel.forward(&q, &k, &v, None).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 8]);
    }

    #[test]
    fn test_weights_are_convex_combination() {
        // With every value row identical, any softmax weighting returns it.
        let device = Device::Cpu;
        let q = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 4), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (1, 6, 2, 4), &device).unwrap();
        let v = Tensor::full(3.5f32, (1, 6, 2, 4), &device).unwrap();

        let out = NaiveKernel.forward(&q, &k, &v, None).unwrap();
        let flat: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for x in flat {
            assert!((x - 3.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_masked_positions_get_zero_weight() {
        let device = Device::Cpu;
        let q = Tensor::randn(0.0f32, 1.0, (1, 1, 1, 4), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (1, 3, 1, 4), &device).unwrap();

        // Values: position 0 -> 1.0, position 1 -> 2.0, position 2 -> 4.0.
        let v = Tensor::from_vec(
            vec![1.0f32, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 4.0, 4.0, 4.0, 4.0],
            (1, 3, 1, 4),
            &device,
        )
        .unwrap();

        // Only position 1 visible.
        let neg = f32::NEG_INFINITY;
        let mask = Tensor::from_vec(vec![neg, 0.0, neg], (1, 1, 1, 3), &device).unwrap();

        let out = NaiveKernel.forward(&q, &k, &v, Some(&mask)).unwrap();
        let flat: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for x in flat {
            assert!((x - 2.0).abs() < 1e-5, "only position 1's value may leak through");
        }
    }

    #[test]
    fn test_mismatched_head_ratio_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 5, 4), candle_core::DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 2, 4), candle_core::DType::F32, &device).unwrap();
        assert!(NaiveKernel.forward(&q, &k, &k, None).is_err());
    }
}
