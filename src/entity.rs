//! Entity records as exchanged with the remote store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a persisted entity.
///
/// Numeric ids are normalized so that `7` and `"7"` address the same entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
  /// Parse an id from text. Empty (or whitespace-only) input is not an id.
  pub fn parse(raw: &str) -> Option<Self> {
    let raw = raw.trim();
    if raw.is_empty() {
      return None;
    }
    match raw.parse::<u64>() {
      Ok(n) => Some(Self(n.to_string())),
      Err(_) => Some(Self(raw.to_string())),
    }
  }

  /// Extract an id from a JSON field value.
  ///
  /// Accepts numbers, strings, and the multi-value shapes `[7]` and
  /// `[{ "value": 7 }]` (first element wins).
  pub fn from_json(value: &Value) -> Option<Self> {
    match value {
      Value::Number(n) => n
        .as_u64()
        .map(|n| Self(n.to_string()))
        .or_else(|| Self::parse(&n.to_string())),
      Value::String(s) => Self::parse(s),
      Value::Array(items) => items.first().and_then(Self::from_json),
      Value::Object(map) => map.get("value").and_then(Self::from_json),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// JSON form of the id: a number when numeric, a string otherwise.
  pub fn to_json(&self) -> Value {
    match self.0.parse::<u64>() {
      Ok(n) => Value::from(n),
      Err(_) => Value::String(self.0.clone()),
    }
  }
}

impl From<u64> for EntityId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Value of a single field: either one value or an ordered multi-value list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Multi(Vec<Value>),
  Single(Value),
}

impl FieldValue {
  pub fn as_json(&self) -> Value {
    match self {
      FieldValue::Multi(items) => Value::Array(items.clone()),
      FieldValue::Single(value) => value.clone(),
    }
  }

  fn from_json(value: Value) -> Self {
    match value {
      Value::Array(items) => FieldValue::Multi(items),
      other => FieldValue::Single(other),
    }
  }

  fn is_null(&self) -> bool {
    matches!(self, FieldValue::Single(Value::Null))
  }
}

/// A typed record: the entity type name plus its field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
  #[serde(rename = "type")]
  pub entity_type: String,
  #[serde(default)]
  pub fields: BTreeMap<String, FieldValue>,
}

impl EntityRecord {
  pub fn new(entity_type: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      fields: BTreeMap::new(),
    }
  }

  /// Builder-style field setter.
  pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.set_field(name, value);
    self
  }

  pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self
      .fields
      .insert(name.into(), FieldValue::from_json(value.into()));
  }

  pub fn field(&self, name: &str) -> Option<&FieldValue> {
    self.fields.get(name).filter(|v| !v.is_null())
  }

  /// The record's id, read from its primary-key field.
  ///
  /// `None` means the record has not been persisted yet.
  pub fn id(&self, primary_key: &str) -> Option<EntityId> {
    self
      .field(primary_key)
      .and_then(|value| EntityId::from_json(&value.as_json()))
  }

  /// Assign the id the remote store handed out for a freshly created record.
  pub fn assign_id(&mut self, primary_key: &str, id: &EntityId) {
    self.set_field(primary_key, id.to_json());
  }

  /// Build a record from a JSON object returned by the remote store.
  ///
  /// Returns `None` when the payload is not an object.
  pub fn from_json(entity_type: &str, value: Value) -> Option<Self> {
    match value {
      Value::Object(map) => Some(Self {
        entity_type: entity_type.to_string(),
        fields: map
          .into_iter()
          .map(|(k, v)| (k, FieldValue::from_json(v)))
          .collect(),
      }),
      _ => None,
    }
  }

  /// Flat JSON object of the fields, as sent to the remote store.
  pub fn to_json(&self) -> Value {
    let map: Map<String, Value> = self
      .fields
      .iter()
      .map(|(k, v)| (k.clone(), v.as_json()))
      .collect();
    Value::Object(map)
  }
}
