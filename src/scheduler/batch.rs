//! Batch-wide scheduling: positions, masks, stop conditions.
//!
//! The scheduler owns every [`Slot`] and is the only component that mutates
//! them. Each decode step it hands the engine the absolute position of each
//! slot's incoming token and an additive attention mask over the key
//! dimension; both are recomputed from slot metadata every step and never
//! persisted.
//!
//! Masking rule: a slot's query may see exactly the valid entries of its
//! *own* cache window. Padding columns for shorter slots get `-inf`, and
//! since every mask row is built from that slot's metadata alone,
//! cross-slot attention is structurally impossible.

use candle_core::{Device, Tensor};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::scheduler::slot::{FinishReason, Slot};

/// Tracks all slots of one decoding session and derives per-step
/// positions, masks, and termination.
#[derive(Debug)]
pub struct BatchScheduler {
    slots: Vec<Slot>,
    /// Ring capacity (window width) shared by every slot.
    capacity: usize,
    max_seq_len: usize,
    max_tokens: usize,
    stop_token_ids: Vec<u32>,
}

impl BatchScheduler {
    /// Create a scheduler with one slot per prompt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty batch, an empty prompt, or a
    /// prompt longer than `max_seq_len`.
    pub fn new(config: &EngineConfig, prompt_lens: &[usize]) -> Result<Self> {
        if prompt_lens.is_empty() {
            return Err(Error::Config("batch must contain at least one prompt".into()));
        }
        for (i, &len) in prompt_lens.iter().enumerate() {
            if len == 0 {
                return Err(Error::Config(format!("prompt for slot {i} is empty")));
            }
            if len > config.max_seq_len {
                return Err(Error::Config(format!(
                    "prompt for slot {i} has {len} tokens, max_seq_len is {}",
                    config.max_seq_len
                )));
            }
        }

        let slots = prompt_lens
            .iter()
            .enumerate()
            .map(|(i, &len)| Slot::new(i, len))
            .collect();

        Ok(Self {
            slots,
            capacity: config.window_capacity(),
            max_seq_len: config.max_seq_len,
            max_tokens: config.sampling.max_tokens,
            stop_token_ids: config.stop_token_ids.clone(),
        })
    }

    /// Number of slots in the batch.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Ring capacity shared by every slot.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrow a slot.
    pub fn slot(&self, slot: usize) -> Result<&Slot> {
        self.slots.get(slot).ok_or(Error::SlotOutOfBounds {
            slot,
            num_slots: self.slots.len(),
        })
    }

    /// All slots, in batch order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Absolute position of each slot's incoming token this step.
    pub fn decode_positions(&self) -> Vec<usize> {
        self.slots.iter().map(Slot::next_position).collect()
    }

    /// A slot's window length after this step's append.
    ///
    /// Active slots gain one entry this step, so they hold
    /// `min(next_position + 1, capacity)` entries. Finished slots stay in
    /// the batch with their cache frozen; their length is whatever was
    /// cached when they finished.
    fn step_window_len(&self, slot: &Slot) -> usize {
        let len = if slot.is_active() {
            slot.next_position() + 1
        } else {
            slot.next_position()
        };
        len.min(self.capacity)
    }

    /// Widest post-append window across the batch this step.
    ///
    /// The engine pads every slot's view out to this width so the batch
    /// stacks into one tensor.
    pub fn decode_kv_width(&self) -> usize {
        self.slots
            .iter()
            .map(|s| self.step_window_len(s))
            .max()
            .unwrap_or(0)
    }

    /// Build the decode-step attention mask `[batch, 1, 1, width]`.
    ///
    /// For slot `i`, key columns beyond its own post-append window length
    /// get `-inf`; the entry appended this step is always visible
    /// (evict-before-append-is-read).
    pub fn decode_mask(&self, device: &Device) -> Result<Tensor> {
        let width = self.decode_kv_width();
        let neg_inf = f32::NEG_INFINITY;

        let data: Vec<f32> = self
            .slots
            .iter()
            .flat_map(|s| {
                let len = self.step_window_len(s);
                (0..width).map(move |j| if j < len { 0.0 } else { neg_inf })
            })
            .collect();

        Ok(Tensor::from_vec(data, (self.slots.len(), 1, 1, width), device)?)
    }

    /// Build the window-aware causal mask for a prefill pass,
    /// `[1, 1, seq_len, seq_len]`.
    ///
    /// Query `i` sees key `j` iff `j <= i` (causal) and `j > i - capacity`
    /// (sliding window), matching token-at-a-time decoding exactly.
    pub fn prefill_mask(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let neg_inf = f32::NEG_INFINITY;
        let capacity = self.capacity;

        let data: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..seq_len).map(move |j| {
                    let visible = j <= i && j + capacity > i;
                    if visible {
                        0.0
                    } else {
                        neg_inf
                    }
                })
            })
            .collect();

        Ok(Tensor::from_vec(data, (1, 1, seq_len, seq_len), device)?)
    }

    /// Record that `n` positions were appended to a slot's cache.
    pub fn advance(&mut self, slot: usize, n: usize) -> Result<()> {
        let num_slots = self.slots.len();
        let slot = self
            .slots
            .get_mut(slot)
            .ok_or(Error::SlotOutOfBounds { slot, num_slots })?;
        slot.advance(n);
        Ok(())
    }

    /// Record one appended position for every active slot (one decode
    /// step). Finished slots are skipped: their cache is frozen and their
    /// position must not drift past the entries actually stored.
    pub fn advance_active(&mut self) {
        for slot in &mut self.slots {
            if slot.is_active() {
                slot.advance(1);
            }
        }
    }

    /// Accept a sampled token for a slot and apply stop conditions.
    ///
    /// Tokens offered to finished slots are discarded: outputs never extend
    /// past the finishing step.
    pub fn accept(&mut self, slot: usize, token: u32) -> Result<()> {
        let num_slots = self.slots.len();
        let max_seq_len = self.max_seq_len;
        let max_tokens = self.max_tokens;
        let is_stop = self.stop_token_ids.contains(&token);

        let slot = self
            .slots
            .get_mut(slot)
            .ok_or(Error::SlotOutOfBounds { slot, num_slots })?;

        if !slot.is_active() {
            return Ok(());
        }

        slot.push_token(token);

        if is_stop {
            slot.finish(FinishReason::StopToken);
        } else if slot.generated().len() >= max_tokens {
            slot.finish(FinishReason::MaxTokens);
        } else if slot.total_len() >= max_seq_len {
            slot.finish(FinishReason::MaxLength);
        }
        Ok(())
    }

    /// Whether every slot has finished.
    pub fn all_finished(&self) -> bool {
        self.slots.iter().all(|s| !s.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowPolicy;

    fn config() -> EngineConfig {
        EngineConfig {
            window: WindowPolicy::Sliding(4),
            max_seq_len: 16,
            stop_token_ids: vec![99],
            ..Default::default()
        }
    }

    fn mask_rows(mask: &Tensor) -> Vec<Vec<f32>> {
        let dims = mask.dims().to_vec();
        let flat: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        flat.chunks(dims[3]).map(|c| c.to_vec()).collect()
    }

    #[test]
    fn test_rejects_bad_prompts() {
        assert!(BatchScheduler::new(&config(), &[]).is_err());
        assert!(BatchScheduler::new(&config(), &[3, 0]).is_err());
        assert!(BatchScheduler::new(&config(), &[17]).is_err());
    }

    #[test]
    fn test_decode_positions_follow_appends() {
        let mut sched = BatchScheduler::new(&config(), &[3, 5]).unwrap();
        sched.advance(0, 3).unwrap();
        sched.advance(1, 5).unwrap();

        assert_eq!(sched.decode_positions(), vec![3, 5]);
        sched.advance_active();
        assert_eq!(sched.decode_positions(), vec![4, 6]);
    }

    #[test]
    fn test_finished_slot_is_frozen() {
        let mut sched = BatchScheduler::new(&config(), &[2, 2]).unwrap();
        sched.advance(0, 2).unwrap();
        sched.advance(1, 2).unwrap();
        sched.accept(0, 99).unwrap(); // stop token: slot 0 finishes

        sched.advance_active();
        sched.advance_active();

        // Slot 0's position and window stay where they were; slot 1 moves on.
        assert_eq!(sched.decode_positions(), vec![2, 4]);
        let rows = mask_rows(&sched.decode_mask(&Device::Cpu).unwrap());
        assert_eq!(&rows[0][..2], &[0.0, 0.0]);
        assert!(rows[0][2].is_infinite());
        assert!(rows[1].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_decode_mask_pads_shorter_slots() {
        let mut sched = BatchScheduler::new(&config(), &[2, 3]).unwrap();
        sched.advance(0, 2).unwrap();
        sched.advance(1, 3).unwrap();

        // Post-append lengths: slot 0 -> 3, slot 1 -> 4 (window is 4).
        assert_eq!(sched.decode_kv_width(), 4);
        let mask = sched.decode_mask(&Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 1, 4]);

        let rows = mask_rows(&mask);
        assert_eq!(&rows[0][..3], &[0.0, 0.0, 0.0]);
        assert!(rows[0][3].is_infinite());
        assert_eq!(&rows[1][..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_decode_mask_capped_by_window() {
        let mut sched = BatchScheduler::new(&config(), &[10]).unwrap();
        sched.advance(0, 10).unwrap();

        // 11 positions would exist unbounded; the window caps at 4.
        assert_eq!(sched.decode_kv_width(), 4);
        let mask = sched.decode_mask(&Device::Cpu).unwrap();
        let rows = mask_rows(&mask);
        assert!(rows[0].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_prefill_mask_causal_and_windowed() {
        let sched = BatchScheduler::new(&config(), &[6]).unwrap();
        let mask = sched.prefill_mask(6, &Device::Cpu).unwrap();
        let rows = mask_rows(&mask);

        // Row 0: only key 0 visible.
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());

        // Row 5 with window 4: keys 2..=5 visible, 0 and 1 outside window.
        assert!(rows[5][0].is_infinite());
        assert!(rows[5][1].is_infinite());
        assert_eq!(&rows[5][2..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_stop_token_finishes_slot() {
        let mut sched = BatchScheduler::new(&config(), &[2]).unwrap();
        sched.accept(0, 7).unwrap();
        assert!(sched.slot(0).unwrap().is_active());

        sched.accept(0, 99).unwrap();
        let slot = sched.slot(0).unwrap();
        assert!(!slot.is_active());
        assert_eq!(slot.finish_reason(), Some(FinishReason::StopToken));
        // The stop token itself terminates the output.
        assert_eq!(slot.generated(), &[7, 99]);
    }

    #[test]
    fn test_finished_slot_discards_tokens() {
        let mut sched = BatchScheduler::new(&config(), &[2]).unwrap();
        sched.accept(0, 99).unwrap();
        sched.accept(0, 1).unwrap();
        sched.accept(0, 2).unwrap();
        assert_eq!(sched.slot(0).unwrap().generated(), &[99]);
    }

    #[test]
    fn test_max_tokens_budget() {
        let mut cfg = config();
        cfg.sampling.max_tokens = 3;
        let mut sched = BatchScheduler::new(&cfg, &[2]).unwrap();

        sched.accept(0, 1).unwrap();
        sched.accept(0, 2).unwrap();
        sched.accept(0, 3).unwrap();

        let slot = sched.slot(0).unwrap();
        assert_eq!(slot.finish_reason(), Some(FinishReason::MaxTokens));
        assert_eq!(slot.generated(), &[1, 2, 3]);
        assert!(sched.all_finished());
    }

    #[test]
    fn test_max_length_bound() {
        let mut cfg = config();
        cfg.max_seq_len = 5;
        let mut sched = BatchScheduler::new(&cfg, &[4]).unwrap();

        sched.accept(0, 1).unwrap();
        let slot = sched.slot(0).unwrap();
        assert_eq!(slot.finish_reason(), Some(FinishReason::MaxLength));
    }

    #[test]
    fn test_all_finished() {
        let mut sched = BatchScheduler::new(&config(), &[2, 2]).unwrap();
        assert!(!sched.all_finished());
        sched.accept(0, 99).unwrap();
        assert!(!sched.all_finished());
        sched.accept(1, 99).unwrap();
        assert!(sched.all_finished());
    }
}
