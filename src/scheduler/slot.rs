//! Per-slot decoding state.

/// Status of a batch slot.
///
/// `Finished` is terminal: a finished slot never accepts another token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Still generating.
    Active,
    /// Generation complete.
    Finished,
}

/// Why a slot finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A configured stop token was sampled.
    StopToken,
    /// The per-slot generation budget was exhausted.
    MaxTokens,
    /// The total sequence reached the maximum length.
    MaxLength,
}

/// One position in the batch: a single sequence's decoding state.
///
/// `tokens_processed` counts positions written to the KV cache and is the
/// absolute position of the next token. It keeps counting past eviction,
/// which is what keeps rotary angles tied to true positions rather than
/// ring indices.
#[derive(Debug, Clone)]
pub struct Slot {
    slot_id: usize,
    prompt_len: usize,
    /// Cached positions so far (prompt + generated tokens already appended).
    tokens_processed: usize,
    /// Generated token ids, in order. Append-only until finished.
    generated: Vec<u32>,
    status: SlotStatus,
    finish_reason: Option<FinishReason>,
}

impl Slot {
    /// Create an active slot for a prompt of `prompt_len` tokens.
    pub fn new(slot_id: usize, prompt_len: usize) -> Self {
        Self {
            slot_id,
            prompt_len,
            tokens_processed: 0,
            generated: Vec::new(),
            status: SlotStatus::Active,
            finish_reason: None,
        }
    }

    /// Slot index within the batch.
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    /// Prompt length in tokens.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Generated token ids so far.
    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    /// Most recently accepted token, the next decode input.
    pub fn last_token(&self) -> Option<u32> {
        self.generated.last().copied()
    }

    /// Current status.
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Whether the slot is still generating.
    pub fn is_active(&self) -> bool {
        self.status == SlotStatus::Active
    }

    /// Finish reason, once finished.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Absolute position of the next token to cache.
    pub fn next_position(&self) -> usize {
        self.tokens_processed
    }

    /// Number of valid cached positions under a window of `capacity`.
    pub fn current_length(&self, capacity: usize) -> usize {
        self.tokens_processed.min(capacity)
    }

    /// Absolute position of the oldest still-valid cached entry.
    pub fn start_offset(&self, capacity: usize) -> usize {
        self.tokens_processed - self.current_length(capacity)
    }

    /// Total sequence length (prompt + generated).
    pub fn total_len(&self) -> usize {
        self.prompt_len + self.generated.len()
    }

    /// Record that `n` positions were appended to the cache.
    pub(crate) fn advance(&mut self, n: usize) {
        self.tokens_processed += n;
    }

    /// Record an accepted token.
    pub(crate) fn push_token(&mut self, token: u32) {
        self.generated.push(token);
    }

    /// Transition to `Finished`.
    pub(crate) fn finish(&mut self, reason: FinishReason) {
        if self.status == SlotStatus::Active {
            self.status = SlotStatus::Finished;
            self.finish_reason = Some(reason);
        }
    }
}
