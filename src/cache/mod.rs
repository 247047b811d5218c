//! KV cache storage.
//!
//! One [`KVCacheStore`](store::KVCacheStore) per decoding session holds, for
//! every layer and batch slot, a fixed-capacity ring of key/value entries.
//! The sliding-window and unbounded variants share this one implementation;
//! the unbounded case simply sizes the ring to the maximum sequence length
//! so eviction never triggers.

pub mod store;

pub use store::{CacheView, KVCacheStore};
