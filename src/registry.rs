//! Entity types known to the store and what each of them supports.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EntityError, EntityResult};

/// Operations the remote store can perform on an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Retrieve,
  Create,
  Update,
  Delete,
  Index,
}

impl Operation {
  pub const ALL: &'static [Operation] = &[
    Operation::Retrieve,
    Operation::Create,
    Operation::Update,
    Operation::Delete,
    Operation::Index,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Retrieve => "retrieve",
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
      Operation::Index => "index",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Handler record for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
  pub name: String,
  /// Field holding the entity id
  pub primary_key: String,
  /// Operations the remote store exposes for this type
  pub operations: Vec<Operation>,
  /// Whether write payloads are wrapped as `{ "<type>": record }`
  pub wrap_writes: bool,
}

impl EntityType {
  /// A type supporting every operation, with unwrapped write payloads.
  pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      primary_key: primary_key.into(),
      operations: Operation::ALL.to_vec(),
      wrap_writes: false,
    }
  }

  pub fn with_operations(mut self, operations: &[Operation]) -> Self {
    self.operations = operations.to_vec();
    self
  }

  pub fn with_wrapped_writes(mut self, wrap: bool) -> Self {
    self.wrap_writes = wrap;
    self
  }

  pub fn supports(&self, operation: Operation) -> bool {
    self.operations.contains(&operation)
  }

  /// Fail with [`EntityError::UnsupportedOperation`] unless `operation` is supported.
  pub fn require(&self, operation: Operation) -> EntityResult<()> {
    if self.supports(operation) {
      Ok(())
    } else {
      Err(EntityError::UnsupportedOperation {
        entity_type: self.name.clone(),
        operation,
      })
    }
  }
}

struct BuiltinType {
  name: &'static str,
  primary_key: &'static str,
  operations: &'static [Operation],
  wrap_writes: bool,
}

/// Types every registry starts with
const BUILTIN_TYPES: &[BuiltinType] = &[
  BuiltinType {
    name: "comment",
    primary_key: "cid",
    operations: Operation::ALL,
    wrap_writes: false,
  },
  BuiltinType {
    name: "file",
    primary_key: "fid",
    operations: &[
      Operation::Retrieve,
      Operation::Create,
      Operation::Delete,
      Operation::Index,
    ],
    wrap_writes: true,
  },
  BuiltinType {
    name: "node",
    primary_key: "nid",
    operations: Operation::ALL,
    wrap_writes: true,
  },
  BuiltinType {
    name: "taxonomy_term",
    primary_key: "tid",
    operations: Operation::ALL,
    wrap_writes: false,
  },
  BuiltinType {
    name: "taxonomy_vocabulary",
    primary_key: "vid",
    operations: Operation::ALL,
    wrap_writes: false,
  },
  BuiltinType {
    name: "user",
    primary_key: "uid",
    operations: Operation::ALL,
    wrap_writes: false,
  },
];

/// Typed lookup table from type name to its handler record.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
  types: BTreeMap<String, EntityType>,
}

impl TypeRegistry {
  /// An empty registry; every lookup misses until types are registered.
  pub fn empty() -> Self {
    Self::default()
  }

  /// A registry preloaded with the built-in types.
  pub fn with_defaults() -> Self {
    let mut registry = Self::empty();
    for builtin in BUILTIN_TYPES {
      registry.register(
        EntityType::new(builtin.name, builtin.primary_key)
          .with_operations(builtin.operations)
          .with_wrapped_writes(builtin.wrap_writes),
      );
    }
    registry
  }

  /// Add a type, replacing any previous registration under the same name.
  pub fn register(&mut self, entity_type: EntityType) {
    self.types.insert(entity_type.name.clone(), entity_type);
  }

  pub fn lookup(&self, name: &str) -> Option<&EntityType> {
    self.types.get(name)
  }

  /// Like [`lookup`](Self::lookup), but an unknown type is an error.
  pub fn resolve(&self, name: &str) -> EntityResult<&EntityType> {
    self
      .lookup(name)
      .ok_or_else(|| EntityError::UnsupportedType(name.to_string()))
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.types.keys().map(String::as_str)
  }

  pub fn types(&self) -> impl Iterator<Item = &EntityType> {
    self.types.values()
  }
}
