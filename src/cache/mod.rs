//! Persisted, time-bounded cache for entities and listings.
//!
//! This module provides:
//! - A raw [`CacheMedium`] abstraction (SQLite, in-memory, no-op)
//! - A [`CacheStore`] that adds per-entry expiration on top of a medium
//! - Lazy expiration: stale entries are deleted when read, never swept
//! - Silent degradation: medium failures behave like cache misses

mod layer;
mod storage;
mod traits;

pub use layer::CacheStore;
pub use storage::{MemoryMedium, NoopMedium, SqliteMedium};
pub use traits::{CacheEntry, CacheMedium, CachedValue, Clock, ManualClock, SystemClock};
