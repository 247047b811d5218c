//! Configuration types for ringkv.
//!
//! All knobs the engine accepts live in [`EngineConfig`]. Validation is
//! eager: [`EngineConfig::validate`] runs before any buffer is allocated,
//! so an invalid head-count ratio or a zero-sized window fails at session
//! setup instead of at first use.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sliding-window policy for the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPolicy {
    /// Keep every cached position up to `max_seq_len` (eviction never triggers).
    Unbounded,
    /// Keep only the most recent `n` positions per slot.
    Sliding(usize),
}

/// Frequency-scaling policy applied to rotary angles for extended context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RopeScaling {
    /// Plain rotary encoding.
    None,
    /// Linear position interpolation: positions are divided by `factor`.
    Linear { factor: f32 },
    /// NTK-aware scaling: the frequency base is rescaled by
    /// `factor^(dim / (dim - 2))`.
    Ntk { factor: f32 },
}

/// Attention kernel selection.
///
/// Both kernels compute the same function; see `attention` module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    /// Materialize the full score matrix, then softmax.
    Naive,
    /// Tiled online-softmax kernel (never materializes the score matrix).
    Fused,
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy argmax).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate per slot.
    pub max_tokens: usize,
    /// RNG seed; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            seed: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_query_heads: usize,
    /// Number of key-value heads (for GQA, typically fewer than query heads).
    pub num_kv_heads: usize,
    /// Dimension per head (must be even for rotary pairs).
    pub head_dim: usize,
    /// KV cache window policy.
    pub window: WindowPolicy,
    /// Rotary frequency base (10000 for most models, 1M for Qwen3-style).
    pub rope_theta: f64,
    /// Rotary frequency-scaling policy.
    pub rope_scaling: RopeScaling,
    /// Maximum total sequence length (prompt + generated).
    pub max_seq_len: usize,
    /// Token ids that terminate a slot when sampled.
    pub stop_token_ids: Vec<u32>,
    /// Sampling configuration.
    pub sampling: SamplingConfig,
    /// Attention kernel to use.
    pub kernel: KernelKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            num_query_heads: 8,
            num_kv_heads: 2,
            head_dim: 64,
            window: WindowPolicy::Unbounded,
            rope_theta: 10000.0,
            rope_scaling: RopeScaling::None,
            max_seq_len: 2048,
            stop_token_ids: Vec::new(),
            sampling: SamplingConfig::default(),
            kernel: KernelKind::Naive,
        }
    }
}

impl EngineConfig {
    /// Effective ring capacity per slot.
    ///
    /// `Unbounded` is subsumed by a window as wide as the maximum sequence
    /// length, so eviction never triggers for it.
    pub fn window_capacity(&self) -> usize {
        match self.window {
            WindowPolicy::Unbounded => self.max_seq_len,
            WindowPolicy::Sliding(n) => n,
        }
    }

    /// Number of query heads sharing each KV head.
    pub fn group_size(&self) -> usize {
        self.num_query_heads / self.num_kv_heads
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any statically invalid combination.
    /// Called by the engine constructor before any allocation.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::Config("num_layers must be > 0".into()));
        }
        if self.num_kv_heads == 0 {
            return Err(Error::Config("num_kv_heads must be > 0".into()));
        }
        if self.num_query_heads == 0 {
            return Err(Error::Config("num_query_heads must be > 0".into()));
        }
        if self.num_query_heads % self.num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "num_query_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_query_heads, self.num_kv_heads
            )));
        }
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "head_dim must be a positive even number, got {}",
                self.head_dim
            )));
        }
        if let WindowPolicy::Sliding(0) = self.window {
            return Err(Error::Config("sliding window capacity must be > 0".into()));
        }
        if self.max_seq_len == 0 {
            return Err(Error::Config("max_seq_len must be > 0".into()));
        }
        if self.sampling.max_tokens == 0 {
            return Err(Error::Config("sampling.max_tokens must be > 0".into()));
        }
        if self.sampling.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be >= 0, got {}",
                self.sampling.temperature
            )));
        }
        match self.rope_scaling {
            RopeScaling::Linear { factor } | RopeScaling::Ntk { factor } if factor <= 0.0 => {
                return Err(Error::Config(format!(
                    "rope scaling factor must be > 0, got {factor}"
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
