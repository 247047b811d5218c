//! Decode engine.
//!
//! This module contains:
//! - [`DecodeEngine`] / [`DecodeSession`] driving batched generation
//! - [`Sampler`] for token selection

pub mod decode;
pub mod sampler;

pub use decode::{DecodeEngine, DecodeSession, GenerationOutput};
pub use sampler::Sampler;
