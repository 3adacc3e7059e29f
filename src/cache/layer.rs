//! Cache store that layers expiry and serialization over a raw medium.

use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{CacheEntry, CacheMedium, CachedValue, Clock, StoredEntry, SystemClock};
use crate::entity::EntityRecord;

/// Key-value cache with per-entry expiration.
///
/// The cache is an optimization, never a correctness dependency: every
/// failure of the underlying medium (I/O, lock poisoning, corrupt payloads)
/// is logged and degrades to a miss.
#[derive(Clone)]
pub struct CacheStore {
  medium: Arc<dyn CacheMedium>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  /// Create a cache store over `medium` using the wall clock.
  pub fn new(medium: impl CacheMedium + 'static) -> Self {
    Self::with_clock(medium, SystemClock)
  }

  pub fn with_clock(medium: impl CacheMedium + 'static, clock: impl Clock + 'static) -> Self {
    Self::from_parts(Arc::new(medium), Arc::new(clock))
  }

  /// Build from shared handles, e.g. to keep a handle on a test clock.
  pub fn from_parts(medium: Arc<dyn CacheMedium>, clock: Arc<dyn Clock>) -> Self {
    Self { medium, clock }
  }

  /// Fetch a live entry.
  ///
  /// Expired entries are deleted as a side effect and reported as absent.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let payload = match self.medium.read(key) {
      Ok(Some(payload)) => payload,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let stored: StoredEntry = match serde_json::from_str(&payload) {
      Ok(stored) => stored,
      Err(e) => {
        warn!(key, error = %e, "corrupt cache payload, discarding");
        self.delete(key);
        return None;
      }
    };

    let entry = CacheEntry {
      key: key.to_string(),
      value: stored.value,
      expires_at: stored.expires_at,
    };

    if entry.is_expired(self.clock.now()) {
      debug!(key, expires_at = entry.expires_at, "cache entry expired");
      self.delete(key);
      return None;
    }

    Some(entry)
  }

  /// Store `value` under `key` for `ttl_secs` seconds (0 = never expires).
  pub fn put(&self, key: &str, value: CachedValue, ttl_secs: u64) {
    let expires_at = if ttl_secs == 0 {
      0
    } else {
      self
        .clock
        .now()
        .saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
    };

    let payload = match serde_json::to_string(&StoredEntry { value, expires_at }) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.medium.write(key, &payload) {
      warn!(key, error = %e, "cache write failed");
    }
  }

  /// Remove `key`. Removing an absent key is not an error.
  pub fn delete(&self, key: &str) {
    if let Err(e) = self.medium.remove(key) {
      warn!(key, error = %e, "cache delete failed");
    }
  }

  /// Drop every entry.
  pub fn clear(&self) {
    if let Err(e) = self.medium.clear() {
      warn!(error = %e, "cache clear failed");
    }
  }

  /// Fetch a live single-record entry.
  pub fn get_record(&self, key: &str) -> Option<EntityRecord> {
    match self.get(key)?.value {
      CachedValue::Record(record) => Some(record),
      CachedValue::List(_) => None,
    }
  }

  /// Fetch a live listing entry.
  pub fn get_list(&self, key: &str) -> Option<Vec<EntityRecord>> {
    match self.get(key)?.value {
      CachedValue::List(records) => Some(records),
      CachedValue::Record(_) => None,
    }
  }
}
