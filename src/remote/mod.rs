//! Contract for the remote-call collaborator.
//!
//! The entity store never talks to the network itself. It hands a
//! [`RemoteRequest`] to a [`RemoteCall`] implementation and waits for a
//! single completion: a [`RemoteResponse`] or a [`RemoteError`]. Retries and
//! timeouts, if any, are the collaborator's business.

pub mod http;

use futures::future::BoxFuture;

use crate::entity::{EntityId, EntityRecord};
pub use crate::error::RemoteError;
use crate::query::QueryDescriptor;
use crate::registry::Operation;

pub use http::HttpRemote;

/// One operation against the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRequest {
  Retrieve {
    entity_type: String,
    id: EntityId,
  },
  Create {
    entity_type: String,
    record: EntityRecord,
  },
  Update {
    entity_type: String,
    id: EntityId,
    record: EntityRecord,
  },
  Delete {
    entity_type: String,
    id: EntityId,
  },
  Index {
    entity_type: String,
    query: QueryDescriptor,
  },
}

impl RemoteRequest {
  pub fn operation(&self) -> Operation {
    match self {
      RemoteRequest::Retrieve { .. } => Operation::Retrieve,
      RemoteRequest::Create { .. } => Operation::Create,
      RemoteRequest::Update { .. } => Operation::Update,
      RemoteRequest::Delete { .. } => Operation::Delete,
      RemoteRequest::Index { .. } => Operation::Index,
    }
  }

  pub fn entity_type(&self) -> &str {
    match self {
      RemoteRequest::Retrieve { entity_type, .. }
      | RemoteRequest::Create { entity_type, .. }
      | RemoteRequest::Update { entity_type, .. }
      | RemoteRequest::Delete { entity_type, .. }
      | RemoteRequest::Index { entity_type, .. } => entity_type,
    }
  }
}

/// Successful completion of a [`RemoteRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
  /// A single record (retrieve, or an update that echoes the record)
  Record(EntityRecord),
  /// An ordered listing (index)
  Records(Vec<EntityRecord>),
  /// A create that assigned `id`; the server may echo the stored record
  Created {
    id: EntityId,
    record: Option<EntityRecord>,
  },
  /// Success with no body (update or delete)
  Empty,
}

/// Asynchronous, single-completion access to the remote store.
///
/// The returned future must resolve exactly once and must not depend on the
/// caller continuing to poll anything else; the store drives it on its own
/// task.
pub trait RemoteCall: Send + Sync {
  fn call(&self, request: RemoteRequest) -> BoxFuture<'static, Result<RemoteResponse, RemoteError>>;
}
