//! # ringkv
//!
//! A batched KV-cache attention engine for autoregressive transformer
//! decoding, built on [candle](https://github.com/huggingface/candle).
//!
//! The crate owns the machinery *around* a model's weights: rotary position
//! encoding, per-slot sliding-window KV caches backed by ring buffers,
//! grouped-query attention (naive and tiled online-softmax kernels), batch
//! scheduling with per-slot stop conditions, and token sampling. The model
//! itself (embeddings, projections, the vocabulary head) plugs in through
//! the [`ModelAdapter`] trait.
//!
//! ## Architecture
//!
//! - [`config`] - engine configuration and validation
//! - [`rope`] - rotary position encoding with linear / NTK frequency scaling
//! - [`cache`] - fixed-capacity ring buffers per (layer, slot)
//! - [`attention`] - GQA attention kernels behind [`AttentionKernel`]
//! - [`scheduler`] - per-slot positions, masks, and termination
//! - [`engine`] - the prefill/decode loop and the sampler
//! - [`model`] - the adapter trait a model implements
//!
//! ## Usage
//!
//! Implement [`ModelAdapter`] for your model, build a [`DecodeEngine`] from
//! an [`EngineConfig`], and either call [`DecodeEngine::generate`] to run a
//! batch of prompts to completion or drive a [`DecodeSession`] step by step.
//!
//! Two invariants the engine maintains everywhere:
//!
//! - **Absolute positions.** Rotary angles are derived from each token's
//!   position in the full sequence, never from its ring index, so cached
//!   entries stay valid across eviction.
//! - **Prefill/decode equivalence.** Prefilling a prompt in one pass leaves
//!   cache contents and next-token logits identical to having decoded the
//!   same tokens one at a time.

pub mod attention;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod rope;
pub mod scheduler;

pub use attention::{build_kernel, AttentionKernel, FusedKernel, NaiveKernel};
pub use cache::{CacheView, KVCacheStore};
pub use config::{EngineConfig, KernelKind, RopeScaling, SamplingConfig, WindowPolicy};
pub use engine::{DecodeEngine, DecodeSession, GenerationOutput, Sampler};
pub use error::{Error, Result};
pub use model::ModelAdapter;
pub use rope::RotaryEncoder;
pub use scheduler::{BatchScheduler, FinishReason, Slot, SlotStatus};
