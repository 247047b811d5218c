//! Shared fixtures for integration tests.
//!
//! `ToyModel` is a tiny transformer stand-in with deterministic weights:
//! no RNG, no files, fully reproducible across runs. `ScriptedModel` wraps
//! it but emits a predetermined token per (slot, step), which lets tests
//! pin down exactly when each slot terminates.

#![allow(dead_code)]

use std::cell::Cell;

use candle_core::{Device, Tensor};

use ringkv::{EngineConfig, ModelAdapter, Result};

/// Deterministic matrix: entries derived from index, scaled small enough
/// that stacked layers stay numerically tame.
pub fn det_matrix(rows: usize, cols: usize, salt: f32, device: &Device) -> Tensor {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| {
            let r = (i / cols) as f32;
            let c = (i % cols) as f32;
            (salt + r * 0.07 + c * 0.013).sin() * 0.1
        })
        .collect();
    Tensor::from_vec(data, (rows, cols), device).unwrap()
}

/// Deterministic `[batch, seq, heads, dim]` tensor for driving kernels and
/// caches directly.
pub fn det_heads(batch: usize, seq: usize, heads: usize, dim: usize, salt: f32) -> Tensor {
    let data: Vec<f32> = (0..batch * seq * heads * dim)
        .map(|i| (salt + i as f32 * 0.1).sin())
        .collect();
    Tensor::from_vec(data, (batch, seq, heads, dim), &Device::Cpu).unwrap()
}

/// A minimal model with fixed weights, enough structure that logits depend
/// on the whole attended context.
pub struct ToyModel {
    wq: Vec<Tensor>,
    wk: Vec<Tensor>,
    wv: Vec<Tensor>,
    wo: Vec<Tensor>,
    wl: Tensor,
    num_query_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    d_model: usize,
}

impl ToyModel {
    pub fn new(config: &EngineConfig, vocab: usize, device: &Device) -> Self {
        let d_model = config.num_query_heads * config.head_dim;
        let d_kv = config.num_kv_heads * config.head_dim;

        let per_layer = |salt: f32, cols: usize| -> Vec<Tensor> {
            (0..config.num_layers)
                .map(|l| det_matrix(d_model, cols, salt + l as f32, device))
                .collect()
        };

        Self {
            wq: per_layer(0.1, d_model),
            wk: per_layer(0.2, d_kv),
            wv: per_layer(0.3, d_kv),
            wo: per_layer(0.4, d_model),
            wl: det_matrix(d_model, vocab, 0.5, device),
            num_query_heads: config.num_query_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            d_model,
        }
    }
}

impl ModelAdapter for ToyModel {
    fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (b, s) = token_ids.dims2()?;
        let ids = token_ids.to_vec2::<u32>()?;
        let mut data = Vec::with_capacity(b * s * self.d_model);
        for row in &ids {
            for &t in row {
                for d in 0..self.d_model {
                    data.push((0.1 * (t as f32 + 1.0) * (d as f32 + 1.0)).sin() * 0.5);
                }
            }
        }
        Ok(Tensor::from_vec(data, (b, s, self.d_model), token_ids.device())?)
    }

    fn project_qkv(&self, layer: usize, hidden: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, s, d) = hidden.dims3()?;
        let flat = hidden.reshape((b * s, d))?;
        let q = flat
            .matmul(&self.wq[layer])?
            .reshape((b, s, self.num_query_heads, self.head_dim))?;
        let k = flat
            .matmul(&self.wk[layer])?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?;
        let v = flat
            .matmul(&self.wv[layer])?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?;
        Ok((q, k, v))
    }

    fn attention_output(&self, layer: usize, attn: &Tensor, residual: &Tensor) -> Result<Tensor> {
        let (b, s, _, _) = attn.dims4()?;
        let mixed = attn
            .reshape((b * s, self.d_model))?
            .matmul(&self.wo[layer])?
            .reshape((b, s, self.d_model))?;
        Ok((mixed + residual)?.tanh()?)
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(hidden.matmul(&self.wl)?)
    }
}

/// Wraps [`ToyModel`] for tensor plumbing but scripts the sampled tokens:
/// slot `i` emits `script[i][0]` at prefill and `script[i][step + 1]` on
/// each decode step (token 0 once a script runs out).
pub struct ScriptedModel {
    inner: ToyModel,
    script: Vec<Vec<u32>>,
    vocab: usize,
    prefills_seen: Cell<usize>,
    steps_seen: Cell<usize>,
}

impl ScriptedModel {
    pub fn new(config: &EngineConfig, vocab: usize, script: Vec<Vec<u32>>) -> Self {
        Self {
            inner: ToyModel::new(config, vocab, &Device::Cpu),
            script,
            vocab,
            prefills_seen: Cell::new(0),
            steps_seen: Cell::new(0),
        }
    }

    fn scripted_token(&self, slot: usize, index: usize) -> u32 {
        self.script[slot].get(index).copied().unwrap_or(0)
    }
}

impl ModelAdapter for ScriptedModel {
    fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.inner.embed(token_ids)
    }

    fn project_qkv(&self, layer: usize, hidden: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        self.inner.project_qkv(layer, hidden)
    }

    fn attention_output(&self, layer: usize, attn: &Tensor, residual: &Tensor) -> Result<Tensor> {
        self.inner.attention_output(layer, attn, residual)
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let b = hidden.dims2()?.0;

        // Prefill calls arrive one slot at a time before any batched step.
        let tokens: Vec<u32> = if b == 1 && self.prefills_seen.get() < self.script.len() {
            let slot = self.prefills_seen.get();
            self.prefills_seen.set(slot + 1);
            vec![self.scripted_token(slot, 0)]
        } else {
            let step = self.steps_seen.get();
            self.steps_seen.set(step + 1);
            (0..b).map(|i| self.scripted_token(i, step + 1)).collect()
        };

        let mut data = vec![0.0f32; b * self.vocab];
        for (i, &t) in tokens.iter().enumerate() {
            data[i * self.vocab + t as usize] = 1.0;
        }
        Ok(Tensor::from_vec(data, (b, self.vocab), hidden.device())?)
    }
}

/// Max absolute elementwise difference between two same-shaped tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Drop-in config for small deterministic runs.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        num_layers: 2,
        num_query_heads: 4,
        num_kv_heads: 2,
        head_dim: 8,
        max_seq_len: 64,
        ..Default::default()
    }
}
