//! Ring-buffer KV cache store.
//!
//! ## Memory layout
//!
//! Each (layer, slot) pair owns a key ring and a value ring of shape
//! `[capacity, num_kv_heads, head_dim]`. Entries are written in place with
//! `slice_scatter`; once a ring is full, each append overwrites the
//! physically oldest entry and bumps the slot's eviction count, which is
//! also the absolute position of the oldest surviving entry.
//!
//! Eviction ordering contract: `append` runs before the step's attention
//! read, so the newly appended entry is always part of the visible window
//! for its own step.
//!
//! Buffers are allocated once per session and never reclaimed while the
//! session is live, even for slots that finish early: strides must stay
//! stable for the slots still decoding.

use candle_core::{DType, Device, Tensor};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Chronologically ordered read view over one slot's valid cache entries.
#[derive(Debug)]
pub struct CacheView {
    /// Absolute sequence position of the oldest entry in the view.
    pub first_position: usize,
    /// Keys `[len, num_kv_heads, head_dim]`, oldest to newest.
    pub keys: Tensor,
    /// Values `[len, num_kv_heads, head_dim]`, oldest to newest.
    pub values: Tensor,
}

impl CacheView {
    /// Number of valid entries in the view.
    pub fn len(&self) -> usize {
        self.keys.dims()[0]
    }

    /// Whether the view holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute positions of the entries, oldest to newest.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.first_position..self.first_position + self.len()
    }
}

/// Physical ring state for one (layer, slot) pair.
#[derive(Debug, Clone, Copy, Default)]
struct RingState {
    /// Next physical write index.
    write_pos: usize,
    /// Number of valid entries, at most `capacity`.
    len: usize,
    /// Entries evicted so far; absolute position of the oldest valid entry.
    evicted: usize,
}

/// Fixed-capacity KV cache for all layers of one decoding session.
#[derive(Debug)]
pub struct KVCacheStore {
    /// Key rings, indexed `[layer][slot]`.
    keys: Vec<Vec<Tensor>>,
    /// Value rings, indexed `[layer][slot]`.
    values: Vec<Vec<Tensor>>,
    /// Ring bookkeeping, indexed `[layer][slot]`.
    rings: Vec<Vec<RingState>>,
    capacity: usize,
    num_layers: usize,
    num_slots: usize,
    device: Device,
}

impl KVCacheStore {
    /// Allocate rings for `batch_size` slots across all configured layers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or
    /// `batch_size` is zero.
    pub fn new(config: &EngineConfig, batch_size: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }

        let capacity = config.window_capacity();
        let shape = (capacity, config.num_kv_heads, config.head_dim);

        let mut keys = Vec::with_capacity(config.num_layers);
        let mut values = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            let mut layer_keys = Vec::with_capacity(batch_size);
            let mut layer_values = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                layer_keys.push(Tensor::zeros(shape, DType::F32, device)?);
                layer_values.push(Tensor::zeros(shape, DType::F32, device)?);
            }
            keys.push(layer_keys);
            values.push(layer_values);
        }

        Ok(Self {
            keys,
            values,
            rings: vec![vec![RingState::default(); batch_size]; config.num_layers],
            capacity,
            num_layers: config.num_layers,
            num_slots: batch_size,
            device: device.clone(),
        })
    }

    /// Ring capacity per slot.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Number of batch slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Number of valid entries for a slot.
    pub fn len(&self, layer: usize, slot: usize) -> Result<usize> {
        self.check_bounds(layer, slot)?;
        Ok(self.rings[layer][slot].len)
    }

    /// Whether a slot holds no entries yet.
    pub fn is_empty(&self, layer: usize, slot: usize) -> Result<bool> {
        Ok(self.len(layer, slot)? == 0)
    }

    /// Absolute position of the oldest valid entry (the eviction count).
    pub fn start_offset(&self, layer: usize, slot: usize) -> Result<usize> {
        self.check_bounds(layer, slot)?;
        Ok(self.rings[layer][slot].evicted)
    }

    /// Absolute position the next appended entry will occupy.
    pub fn next_position(&self, layer: usize, slot: usize) -> Result<usize> {
        self.check_bounds(layer, slot)?;
        let ring = &self.rings[layer][slot];
        Ok(ring.evicted + ring.len)
    }

    /// Append one key/value entry to a slot's ring.
    ///
    /// If the ring is at capacity the logically oldest entry is overwritten
    /// in place and the slot's start offset advances by one.
    ///
    /// # Arguments
    ///
    /// * `key` / `value` - Entry tensors `[num_kv_heads, head_dim]`
    ///
    /// # Returns
    ///
    /// The physical ring index the entry was written to.
    pub fn append(&mut self, layer: usize, slot: usize, key: &Tensor, value: &Tensor) -> Result<usize> {
        self.check_bounds(layer, slot)?;

        let ring = self.rings[layer][slot];
        if ring.len > self.capacity {
            return Err(Error::CapacityExceeded {
                slot,
                len: ring.len,
                capacity: self.capacity,
            });
        }

        let pos = ring.write_pos;
        let key = key.unsqueeze(0)?;
        let value = value.unsqueeze(0)?;
        self.keys[layer][slot] = self.keys[layer][slot].slice_scatter(&key, 0, pos)?;
        self.values[layer][slot] = self.values[layer][slot].slice_scatter(&value, 0, pos)?;

        let ring = &mut self.rings[layer][slot];
        ring.write_pos = (pos + 1) % self.capacity;
        if ring.len == self.capacity {
            ring.evicted += 1;
        } else {
            ring.len += 1;
        }

        Ok(pos)
    }

    /// Append a run of entries (a prefill chunk) to a slot's ring.
    ///
    /// Entries are appended oldest-first with the same eviction rule as
    /// [`append`](Self::append), so a run longer than the capacity leaves
    /// exactly the last `capacity` entries resident.
    ///
    /// # Arguments
    ///
    /// * `keys` / `values` - Run tensors `[run_len, num_kv_heads, head_dim]`
    pub fn append_run(
        &mut self,
        layer: usize,
        slot: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<()> {
        let run_len = keys.dims()[0];
        for i in 0..run_len {
            let k = keys.narrow(0, i, 1)?.squeeze(0)?;
            let v = values.narrow(0, i, 1)?.squeeze(0)?;
            self.append(layer, slot, &k, &v)?;
        }
        Ok(())
    }

    /// Read a slot's valid entries in chronological order.
    ///
    /// Oldest-to-newest ordering is restored by gathering physical indices
    /// starting at the ring's logical head, regardless of where the ring
    /// has wrapped.
    pub fn valid_view(&self, layer: usize, slot: usize) -> Result<CacheView> {
        self.check_bounds(layer, slot)?;

        let ring = &self.rings[layer][slot];
        let start_phys = (ring.write_pos + self.capacity - ring.len) % self.capacity;
        let indices: Vec<u32> = (0..ring.len)
            .map(|i| ((start_phys + i) % self.capacity) as u32)
            .collect();
        let indices = Tensor::new(indices.as_slice(), &self.device)?;

        Ok(CacheView {
            first_position: ring.evicted,
            keys: self.keys[layer][slot].index_select(&indices, 0)?,
            values: self.values[layer][slot].index_select(&indices, 0)?,
        })
    }

    /// Clear all ring bookkeeping without reallocating buffers.
    pub fn reset(&mut self) {
        for layer in &mut self.rings {
            for ring in layer.iter_mut() {
                *ring = RingState::default();
            }
        }
    }

    fn check_bounds(&self, layer: usize, slot: usize) -> Result<()> {
        if layer >= self.num_layers {
            return Err(Error::LayerOutOfBounds {
                layer,
                num_layers: self.num_layers,
            });
        }
        if slot >= self.num_slots {
            return Err(Error::SlotOutOfBounds {
                slot,
                num_slots: self.num_slots,
            });
        }
        Ok(())
    }
}
