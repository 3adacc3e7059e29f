//! Deterministic keys for cache entries and coalesced requests.

use sha2::{Digest, Sha256};

use crate::entity::{EntityId, EntityRecord};
use crate::query::QueryDescriptor;

/// Cache key for a single entity.
pub fn entity_key(entity_type: &str, id: &EntityId) -> String {
  format!("entity:{}:{}", entity_type, id)
}

/// Cache key for a listing of `entity_type` described by `query`.
pub fn listing_key(entity_type: &str, query: &QueryDescriptor) -> String {
  format!("index:{}:{}", entity_type, listing_hash(query))
}

/// Stable identity of a listing request, independent of the entity type.
pub fn listing_hash(query: &QueryDescriptor) -> String {
  sha256_hex(&query.to_query_string())
}

/// Identity of a not-yet-persisted record, used to coalesce duplicate creates.
///
/// Fields are kept in a sorted map, so equal records hash equally.
pub fn content_hash(record: &EntityRecord) -> String {
  sha256_hex(&record.to_json().to_string())
}

fn sha256_hex(input: &str) -> String {
  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
