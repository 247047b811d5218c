//! Batch scheduling.
//!
//! This module tracks per-slot decoding state and derives everything the
//! step needs from it:
//! - absolute position indices for the rotary encoder,
//! - attention masks for prefill and decode,
//! - stop-condition handling and batch-level termination.

pub mod batch;
pub mod slot;

pub use batch::BatchScheduler;
pub use slot::{FinishReason, Slot, SlotStatus};
