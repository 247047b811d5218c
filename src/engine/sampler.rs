//! Token sampling.
//!
//! Turns a row of vocabulary logits into a token id. Temperature 0 selects
//! greedily; otherwise logits are temperature-scaled, optionally truncated
//! by top-k and nucleus (top-p) filtering, and sampled from the remaining
//! distribution.

use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Stateful sampler. Holds the RNG so repeated calls with the same seed
/// reproduce the same token stream.
#[derive(Debug)]
pub struct Sampler {
    temperature: f32,
    /// 0 disables top-k filtering.
    top_k: usize,
    /// 1.0 disables nucleus filtering.
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler from the session's sampling parameters.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Sample one token per batch row.
    ///
    /// Accepts logits shaped `[vocab]` or `[batch, vocab]` and returns one
    /// token id per row.
    ///
    /// # Errors
    ///
    /// Returns an error for logits of any other rank or an all-`-inf` row.
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let rows: Vec<Vec<f32>> = match logits.dims() {
            [_] => vec![logits.to_vec1()?],
            [_, _] => logits.to_vec2()?,
            dims => {
                return Err(Error::Config(format!(
                    "logits must be rank 1 or 2, got shape {dims:?}"
                )))
            }
        };

        rows.into_iter().map(|row| self.sample_row(row)).collect()
    }

    fn sample_row(&mut self, logits: Vec<f32>) -> Result<u32> {
        if self.temperature == 0.0 {
            return argmax(&logits);
        }

        let mut scaled: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &x)| (i, x / self.temperature))
            .collect();

        // Descending by logit; top-k keeps the head of this order.
        scaled.sort_by(|a, b| b.1.total_cmp(&a.1));
        if self.top_k > 0 {
            scaled.truncate(self.top_k);
        }

        // Softmax over the survivors, max-subtracted for stability.
        let max = scaled
            .first()
            .map(|&(_, x)| x)
            .ok_or_else(|| Error::Config("cannot sample from empty logits".into()))?;
        let mut probs: Vec<(usize, f32)> = scaled
            .into_iter()
            .map(|(i, x)| (i, (x - max).exp()))
            .collect();
        let total: f32 = probs.iter().map(|&(_, p)| p).sum();
        if total <= 0.0 || !total.is_finite() {
            return Err(Error::Config(
                "sampling distribution has no finite mass".into(),
            ));
        }
        for p in &mut probs {
            p.1 /= total;
        }

        // Nucleus filtering: keep the smallest prefix with mass >= top_p.
        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, &(_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        let dist = WeightedIndex::new(probs.iter().map(|&(_, p)| p))
            .map_err(|e| Error::Config(format!("invalid sampling distribution: {e}")))?;
        let choice = dist.sample(&mut self.rng);
        Ok(probs[choice].0 as u32)
    }
}

fn argmax(logits: &[f32]) -> Result<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| Error::Config("cannot sample from empty logits".into()))
}
