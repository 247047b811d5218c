//! The decode loop.
//!
//! [`DecodeEngine`] holds the pieces shared by every session: the rotary
//! table, the attention kernel, and the configuration. A [`DecodeSession`]
//! owns one batch's mutable state (KV store, scheduler, sampler) and drives
//! it one step at a time.
//!
//! Per-step ordering is fixed and matters for correctness:
//! 1. rotate Q/K at each slot's absolute position,
//! 2. append the new K/V entry to each active slot's ring,
//! 3. build the mask from *post-append* lengths (the entry appended this
//!    step is always visible to its own query),
//! 4. attend over each slot's chronological cache view,
//! 5. advance positions, sample, and apply stop conditions.

use candle_core::{Device, Tensor};

use crate::attention::{build_kernel, AttentionKernel};
use crate::cache::KVCacheStore;
use crate::config::EngineConfig;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::model::ModelAdapter;
use crate::rope::RotaryEncoder;
use crate::scheduler::{BatchScheduler, FinishReason};

/// Completed output for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Slot index within the batch.
    pub slot_id: usize,
    /// Generated token ids, in order. When a stop token fired, it is the
    /// last element.
    pub token_ids: Vec<u32>,
    /// Why generation stopped; `None` if the session was abandoned early.
    pub finish_reason: Option<FinishReason>,
}

/// Session-independent decoding machinery.
#[derive(Debug)]
pub struct DecodeEngine {
    config: EngineConfig,
    rope: RotaryEncoder,
    kernel: Box<dyn AttentionKernel>,
    device: Device,
}

impl DecodeEngine {
    /// Build an engine on `device`.
    ///
    /// Validates the configuration and precomputes the rotary table for
    /// every position up to `max_seq_len`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn new(config: EngineConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let rope = RotaryEncoder::new(
            config.head_dim,
            config.max_seq_len,
            config.rope_theta,
            config.rope_scaling,
            device,
        )?;
        let kernel = build_kernel(config.kernel);
        Ok(Self {
            config,
            rope,
            kernel,
            device: device.clone(),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a session: allocate caches, prefill every prompt, and sample
    /// each slot's first token.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty batch, an empty prompt, or a prompt
    /// longer than `max_seq_len`.
    pub fn begin_session<'a, M: ModelAdapter>(
        &'a self,
        model: &'a M,
        prompts: &[Vec<u32>],
    ) -> Result<DecodeSession<'a, M>> {
        let prompt_lens: Vec<usize> = prompts.iter().map(Vec::len).collect();
        let scheduler = BatchScheduler::new(&self.config, &prompt_lens)?;
        let store = KVCacheStore::new(&self.config, prompts.len(), &self.device)?;
        let sampler = Sampler::new(&self.config.sampling);

        let mut session = DecodeSession {
            engine: self,
            model,
            store,
            scheduler,
            sampler,
        };
        for (slot, prompt) in prompts.iter().enumerate() {
            session.prefill(slot, prompt)?;
        }
        Ok(session)
    }

    /// Run a batch of prompts to completion and collect the outputs.
    pub fn generate<M: ModelAdapter>(
        &self,
        model: &M,
        prompts: &[Vec<u32>],
    ) -> Result<Vec<GenerationOutput>> {
        let mut session = self.begin_session(model, prompts)?;
        // Every step adds one token to every active slot, so max_tokens
        // steps suffice for every slot to hit a stop condition.
        for _ in 0..self.config.sampling.max_tokens {
            if session.step()? {
                break;
            }
        }
        Ok(session.finish())
    }
}

/// One batch's in-flight decoding state.
#[derive(Debug)]
pub struct DecodeSession<'a, M: ModelAdapter> {
    engine: &'a DecodeEngine,
    model: &'a M,
    store: KVCacheStore,
    scheduler: BatchScheduler,
    sampler: Sampler,
}

impl<M: ModelAdapter> DecodeSession<'_, M> {
    /// Process one prompt in a single pass.
    ///
    /// The whole prompt is rotated, attended with the window-aware causal
    /// mask, and appended to the slot's ring. A run longer than the window
    /// leaves exactly the last `capacity` entries resident, so the state
    /// afterwards is identical to having decoded the prompt one token at a
    /// time.
    fn prefill(&mut self, slot: usize, prompt: &[u32]) -> Result<()> {
        let device = &self.engine.device;
        let n = prompt.len();

        let input = Tensor::new(prompt, device)?.reshape((1, n))?;
        let mut hidden = self.model.embed(&input)?;
        let positions: Vec<usize> = (0..n).collect();
        let mask = self.scheduler.prefill_mask(n, device)?;

        for layer in 0..self.engine.config.num_layers {
            let (q, k, v) = self.model.project_qkv(layer, &hidden)?;
            let (q, k) = self.engine.rope.apply(&q, &k, &positions)?;
            let attn = self.engine.kernel.forward(&q, &k, &v, Some(&mask))?;
            self.store
                .append_run(layer, slot, &k.squeeze(0)?, &v.squeeze(0)?)?;
            hidden = self.model.attention_output(layer, &attn, &hidden)?;
        }
        self.scheduler.advance(slot, n)?;

        let last = hidden.narrow(1, n - 1, 1)?.squeeze(1)?;
        let logits = self.model.logits(&last)?;
        let token = self.sampler.sample(&logits)?[0];
        self.scheduler.accept(slot, token)
    }

    /// Run one decode step for the whole batch.
    ///
    /// Returns `true` once every slot has finished. Finished slots stay in
    /// the batch to keep tensor shapes uniform; their caches are frozen and
    /// their sampled tokens discarded.
    pub fn step(&mut self) -> Result<bool> {
        if self.scheduler.all_finished() {
            return Ok(true);
        }
        let device = &self.engine.device;
        let batch = self.scheduler.num_slots();

        let inputs: Vec<u32> = self
            .scheduler
            .slots()
            .iter()
            .map(|s| {
                s.last_token().ok_or_else(|| {
                    Error::Config(format!("slot {} has no sampled token", s.slot_id()))
                })
            })
            .collect::<Result<_>>()?;
        let input = Tensor::new(inputs.as_slice(), device)?.reshape((batch, 1))?;
        let positions = self.scheduler.decode_positions();
        let width = self.scheduler.decode_kv_width();
        let mask = self.scheduler.decode_mask(device)?;

        let mut hidden = self.model.embed(&input)?;
        for layer in 0..self.engine.config.num_layers {
            let (q, k, v) = self.model.project_qkv(layer, &hidden)?;
            let (q, k) = self.engine.rope.apply(&q, &k, &positions)?;

            let mut keys = Vec::with_capacity(batch);
            let mut values = Vec::with_capacity(batch);
            for slot in 0..batch {
                if self.scheduler.slot(slot)?.is_active() {
                    let k_new = k.narrow(0, slot, 1)?.squeeze(0)?.squeeze(0)?;
                    let v_new = v.narrow(0, slot, 1)?.squeeze(0)?.squeeze(0)?;
                    self.store.append(layer, slot, &k_new, &v_new)?;
                    debug_assert_eq!(
                        self.store.next_position(layer, slot)?,
                        positions[slot] + 1
                    );
                }
                let view = self.store.valid_view(layer, slot)?;
                keys.push(pad_rows(&view.keys, width)?.unsqueeze(0)?);
                values.push(pad_rows(&view.values, width)?.unsqueeze(0)?);
            }
            let k_batch = Tensor::cat(&keys, 0)?;
            let v_batch = Tensor::cat(&values, 0)?;

            let attn = self
                .engine
                .kernel
                .forward(&q, &k_batch, &v_batch, Some(&mask))?;
            hidden = self.model.attention_output(layer, &attn, &hidden)?;
        }
        self.scheduler.advance_active();

        let logits = self.model.logits(&hidden.squeeze(1)?)?;
        let tokens = self.sampler.sample(&logits)?;
        for (slot, &token) in tokens.iter().enumerate() {
            self.scheduler.accept(slot, token)?;
        }
        Ok(self.scheduler.all_finished())
    }

    /// Whether every slot has finished.
    pub fn is_done(&self) -> bool {
        self.scheduler.all_finished()
    }

    /// Scheduler state, for inspection.
    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Cache state, for inspection.
    pub fn store(&self) -> &KVCacheStore {
        &self.store
    }

    /// Consume the session and collect per-slot outputs in batch order.
    pub fn finish(self) -> Vec<GenerationOutput> {
        self.scheduler
            .slots()
            .iter()
            .map(|s| GenerationOutput {
                slot_id: s.slot_id(),
                token_ids: s.generated().to_vec(),
                finish_reason: s.finish_reason(),
            })
            .collect()
    }
}

/// Zero-pad a `[len, heads, dim]` view out to `[width, heads, dim]`.
///
/// Padded rows are masked out for every slot, so their contents never reach
/// the softmax.
fn pad_rows(x: &Tensor, width: usize) -> Result<Tensor> {
    let (len, heads, dim) = x.dims3()?;
    if len == width {
        return Ok(x.clone());
    }
    let pad = Tensor::zeros((width - len, heads, dim), x.dtype(), x.device())?;
    Ok(Tensor::cat(&[x, &pad], 0)?)
}
