//! Core traits and types for the caching system.

use chrono::Utc;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::entity::EntityRecord;

/// Durable key-value medium backing the cache.
///
/// Payloads are opaque strings; expiry and (de)serialization live in
/// [`CacheStore`](super::CacheStore). Any error returned here is treated
/// as a cache miss by the store.
pub trait CacheMedium: Send + Sync {
  /// Read the payload stored under `key`.
  fn read(&self, key: &str) -> Result<Option<String>>;

  /// Store `payload` under `key`, replacing any previous payload.
  fn write(&self, key: &str, payload: &str) -> Result<()>;

  /// Remove `key`. Removing an absent key succeeds.
  fn remove(&self, key: &str) -> Result<()>;

  /// Remove every entry.
  fn clear(&self) -> Result<()>;
}

/// Source of the current time, in Unix seconds.
pub trait Clock: Send + Sync {
  fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> i64 {
    Utc::now().timestamp()
  }
}

/// Clock that only moves when told to. Used to test expiry without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start: i64) -> Self {
    Self {
      now: AtomicI64::new(start),
    }
  }

  pub fn set(&self, now: i64) {
    self.now.store(now, Ordering::SeqCst);
  }

  pub fn advance(&self, secs: i64) {
    self.now.fetch_add(secs, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

/// What a cache entry holds: one record, or an ordered listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedValue {
  Record(EntityRecord),
  List(Vec<EntityRecord>),
}

/// A live cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub value: CachedValue,
  /// Unix seconds after which the entry is gone; 0 means never
  pub expires_at: i64,
}

impl CacheEntry {
  /// Whether the entry is past its expiry at `now`.
  ///
  /// An entry is still live during the second it expires at, and gone
  /// once that second is in the past.
  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at != 0 && now > self.expires_at
  }
}

/// Serialized form of an entry as written to the medium.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
  pub value: CachedValue,
  #[serde(rename = "expiresAt")]
  pub expires_at: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(expires_at: i64) -> CacheEntry {
    CacheEntry {
      key: "entity:node:1".into(),
      value: CachedValue::List(Vec::new()),
      expires_at,
    }
  }

  #[test]
  fn test_zero_never_expires() {
    assert!(!entry(0).is_expired(i64::MAX));
  }

  #[test]
  fn test_expiration_boundary() {
    assert!(!entry(100).is_expired(99));
    assert!(!entry(100).is_expired(100));
    assert!(entry(100).is_expired(101));
  }

  #[test]
  fn test_manual_clock() {
    let clock = ManualClock::new(10);
    clock.advance(5);
    assert_eq!(clock.now(), 15);
    clock.set(3);
    assert_eq!(clock.now(), 3);
  }

  #[test]
  fn test_cached_value_shapes() {
    let record = EntityRecord::new("node").with_field("nid", 1);
    let json = serde_json::to_string(&CachedValue::Record(record.clone())).unwrap();
    assert!(matches!(
      serde_json::from_str::<CachedValue>(&json).unwrap(),
      CachedValue::Record(r) if r == record
    ));

    let json = serde_json::to_string(&CachedValue::List(vec![record])).unwrap();
    assert!(matches!(
      serde_json::from_str::<CachedValue>(&json).unwrap(),
      CachedValue::List(items) if items.len() == 1
    ));
  }
}
