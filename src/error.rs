//! Error types for ringkv.

use thiserror::Error;

/// Result type alias for ringkv operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ringkv.
///
/// Every variant is fatal for the running batch: all operations in this
/// crate are deterministic in-memory computations, so a failure signals a
/// configuration problem or a caller bug, never a transient condition.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid static configuration, detected at session setup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Slot index outside the batch the session was sized for.
    #[error("slot {slot} out of bounds (batch has {num_slots} slots)")]
    SlotOutOfBounds { slot: usize, num_slots: usize },

    /// Layer index outside the configured layer count.
    #[error("layer {layer} out of bounds (model has {num_layers} layers)")]
    LayerOutOfBounds { layer: usize, num_layers: usize },

    /// Ring bookkeeping invariant violated. Never expected in correct
    /// operation; tested explicitly.
    #[error("cache capacity exceeded: slot {slot} holds {len} of {capacity} entries")]
    CapacityExceeded {
        slot: usize,
        len: usize,
        capacity: usize,
    },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
