//! Client-side entity access with a TTL cache and request coalescing.
//!
//! [`EntityStore`] sits between callers and a remote record store. Reads are
//! answered from a [`CacheStore`] when the type's policy allows it, concurrent
//! identical requests share a single remote call, and writes invalidate the
//! cached copies they make stale.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod keys;
pub mod logging;
pub mod pending;
pub mod query;
pub mod registry;
pub mod remote;

pub use cache::CacheStore;
pub use config::{CachePolicy, CacheSettings, Config};
pub use dispatch::{EntityStore, LoadOptions};
pub use entity::{EntityId, EntityRecord, FieldValue};
pub use error::{EntityError, EntityResult, RemoteError};
pub use pending::{PendingRequests, RequestKey};
pub use query::{Comparison, QueryDescriptor, QueryOption, SortDirection};
pub use registry::{EntityType, Operation, TypeRegistry};
pub use remote::{HttpRemote, RemoteCall, RemoteRequest, RemoteResponse};
