//! Error types surfaced to callers of the entity store.

use std::fmt;
use thiserror::Error;

use crate::registry::Operation;

/// Failure reported by the remote-call collaborator.
///
/// Cloned verbatim to every caller waiting on the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
  /// HTTP-like status code, when the transport produced one
  pub status: Option<u16>,
  /// Short machine-oriented code (e.g. "timeout", "not_found")
  pub code: String,
  /// Human-readable detail
  pub detail: String,
}

impl RemoteError {
  pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
    Self {
      status: None,
      code: code.into(),
      detail: detail.into(),
    }
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }
}

impl fmt::Display for RemoteError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status {
      Some(status) => write!(f, "{} ({}): {}", self.code, status, self.detail),
      None => write!(f, "{}: {}", self.code, self.detail),
    }
  }
}

impl std::error::Error for RemoteError {}

/// Errors returned by [`EntityStore`](crate::EntityStore) operations.
///
/// Cache failures never appear here; they degrade to a remote fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
  /// The type registry does not know this entity type
  #[error("unsupported entity type: {0}")]
  UnsupportedType(String),

  /// The type is known but does not support the requested operation
  #[error("entity type {entity_type} does not support {operation}")]
  UnsupportedOperation {
    entity_type: String,
    operation: Operation,
  },

  /// An addressed operation was requested for a record without an id
  #[error("{operation} on {entity_type} requires an entity id")]
  MissingId {
    entity_type: String,
    operation: Operation,
  },

  /// The remote store returned something other than what the operation expects
  #[error("unexpected response for {operation} on {entity_type}: {detail}")]
  UnexpectedResponse {
    entity_type: String,
    operation: Operation,
    detail: String,
  },

  /// The remote call failed
  #[error("remote call failed: {0}")]
  Remote(#[from] RemoteError),

  /// The dispatch task ended without delivering a result
  #[error("request was abandoned before completing")]
  Abandoned,
}

/// Convenience result type for entity store operations.
pub type EntityResult<T> = std::result::Result<T, EntityError>;
