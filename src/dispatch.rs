//! Entity access dispatcher: cache, coalescing and remote calls in one place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{CacheStore, CachedValue};
use crate::config::{CachePolicy, CacheSettings};
use crate::entity::{EntityId, EntityRecord};
use crate::error::{EntityError, EntityResult};
use crate::keys;
use crate::pending::{Continuation, Enrollment, PendingRequests, RequestKey};
use crate::query::QueryDescriptor;
use crate::registry::{EntityType, Operation, TypeRegistry};
use crate::remote::{RemoteCall, RemoteRequest, RemoteResponse};

/// What a settled request hands to every waiting caller.
#[derive(Debug, Clone)]
enum Outcome {
  Record(EntityRecord),
  Records(Vec<EntityRecord>),
  Removed,
}

type Queue = PendingRequests<Outcome, EntityError>;

/// Options for [`EntityStore::load_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
  /// Drop any cached copy first so the remote store is consulted
  pub reset: bool,
}

struct Inner {
  registry: TypeRegistry,
  settings: CacheSettings,
  cache: CacheStore,
  pending: Queue,
  remote: Arc<dyn RemoteCall>,
  generations: Generations,
}

impl Inner {
  /// Drop the cached copy of an entity after a successful write.
  fn invalidate(&self, entity_type: &str, cache_key: &str) {
    let mut counters = self.generations.lock();
    for key in [type_generation_key(entity_type), cache_key.to_string()] {
      *counters.entry(key).or_insert(0) += 1;
    }
    self.cache.delete(cache_key);
  }

  /// Run `store` against the cache unless a write bumped `generation_key`
  /// past `seen`. Writes cannot interleave with `store`.
  fn store_unless_written(
    &self,
    generation_key: &str,
    seen: u64,
    store: impl FnOnce(&CacheStore),
  ) -> bool {
    let counters = self.generations.lock();
    if counters.get(generation_key).copied().unwrap_or(0) != seen {
      return false;
    }
    store(&self.cache);
    true
  }
}

/// Write counters per entity cache key and per type.
///
/// A read snapshots the counter before its remote call and only writes its
/// result back if no write landed in the meantime.
#[derive(Default)]
struct Generations {
  counters: Mutex<HashMap<String, u64>>,
}

impl Generations {
  fn current(&self, key: &str) -> u64 {
    self.lock().get(key).copied().unwrap_or(0)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
    self.counters.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn type_generation_key(entity_type: &str) -> String {
  format!("type:{}", entity_type)
}

/// Entity access layer with transparent caching and request coalescing.
///
/// For any `(type, operation, target)` at most one remote call is in flight;
/// callers arriving meanwhile wait for that call's result. Reads are served
/// from the cache when the type's policy allows it, and successful writes
/// invalidate the cached copy of the entity they touched.
///
/// Remote calls are driven on spawned tokio tasks, so every operation must be
/// awaited from within a tokio runtime.
#[derive(Clone)]
pub struct EntityStore {
  inner: Arc<Inner>,
}

impl EntityStore {
  pub fn new(
    registry: TypeRegistry,
    settings: CacheSettings,
    cache: CacheStore,
    remote: Arc<dyn RemoteCall>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        registry,
        settings,
        cache,
        pending: Queue::new(),
        remote,
        generations: Generations::default(),
      }),
    }
  }

  pub fn registry(&self) -> &TypeRegistry {
    &self.inner.registry
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn policy_for(&self, entity_type: &str) -> CachePolicy {
    self.inner.settings.policy_for(entity_type)
  }

  /// Whether a remote call for `key` is outstanding.
  pub fn is_in_flight(&self, key: &RequestKey) -> bool {
    self.inner.pending.is_in_flight(key)
  }

  /// Number of callers waiting on `key`.
  pub fn waiting(&self, key: &RequestKey) -> usize {
    self.inner.pending.waiting(key)
  }

  /// Load a single entity.
  pub async fn load(&self, entity_type: &str, id: impl Into<EntityId>) -> EntityResult<EntityRecord> {
    self.load_with(entity_type, id, LoadOptions::default()).await
  }

  /// Load a single entity.
  ///
  /// 1. Join an in-flight retrieve for the same entity, if any
  /// 2. Otherwise serve a live cached copy (when caching is enabled)
  /// 3. Otherwise call the remote store, cache the result, wake all waiters
  pub async fn load_with(
    &self,
    entity_type: &str,
    id: impl Into<EntityId>,
    options: LoadOptions,
  ) -> EntityResult<EntityRecord> {
    let id = id.into();
    let ty = self.resolve(entity_type, Operation::Retrieve)?;
    let policy = self.policy_for(entity_type);
    let cache_key = keys::entity_key(entity_type, &id);
    let key = RequestKey::new(entity_type, Operation::Retrieve, id.as_str());

    if options.reset {
      self.inner.cache.delete(&cache_key);
    }

    if policy.enabled && !self.is_in_flight(&key) {
      if let Some(record) = self.inner.cache.get_record(&cache_key) {
        debug!(%key, "cache hit");
        return Ok(record);
      }
    }

    let type_name = ty.name.clone();
    let generation = self.inner.generations.current(&cache_key);
    let request = RemoteRequest::Retrieve {
      entity_type: type_name.clone(),
      id,
    };
    let outcome = self
      .join_or_dispatch(key, request, move |inner, response| match response {
        RemoteResponse::Record(mut record) => {
          record.entity_type = type_name;
          if policy.enabled {
            let stored = inner.store_unless_written(&cache_key, generation, |cache| {
              cache.put(&cache_key, CachedValue::Record(record.clone()), policy.ttl_secs)
            });
            if !stored {
              debug!(cache_key = %cache_key, "entity written during retrieve, not caching");
            }
          }
          Ok(Outcome::Record(record))
        }
        other => Err(unexpected(&type_name, Operation::Retrieve, &other)),
      })
      .await?;

    expect_record(outcome, entity_type, Operation::Retrieve)
  }

  /// Persist a record: create it when it has no id, update it otherwise.
  ///
  /// Types that cannot be updated are always created.
  pub async fn save(&self, record: EntityRecord) -> EntityResult<EntityRecord> {
    let ty = self.inner.registry.resolve(&record.entity_type)?;
    if record.id(&ty.primary_key).is_some() && ty.supports(Operation::Update) {
      self.update(record).await
    } else {
      self.create(record).await
    }
  }

  /// Create a new record and return it with the id the remote store assigned.
  ///
  /// Identical concurrent creates share one remote call.
  pub async fn create(&self, record: EntityRecord) -> EntityResult<EntityRecord> {
    let ty = self.resolve(&record.entity_type, Operation::Create)?;
    let primary_key = ty.primary_key.clone();
    let entity_type = ty.name.clone();
    let key = RequestKey::new(
      entity_type.as_str(),
      Operation::Create,
      keys::content_hash(&record),
    );

    let request = RemoteRequest::Create {
      entity_type: entity_type.clone(),
      record: record.clone(),
    };
    let outcome = self
      .join_or_dispatch(key, request, move |inner, response| {
        let (id, mut created) = match response {
          RemoteResponse::Created { id, record: echoed } => (id, echoed.unwrap_or(record)),
          RemoteResponse::Record(echoed) => match echoed.id(&primary_key) {
            Some(id) => (id, echoed),
            None => {
              return Err(EntityError::UnexpectedResponse {
                entity_type,
                operation: Operation::Create,
                detail: "created record carries no id".into(),
              })
            }
          },
          other => return Err(unexpected(&entity_type, Operation::Create, &other)),
        };

        // The id is only known now; assign it before anyone sees the record.
        created.entity_type = entity_type.clone();
        created.assign_id(&primary_key, &id);
        inner.invalidate(&entity_type, &keys::entity_key(&entity_type, &id));
        Ok(Outcome::Record(created))
      })
      .await?;

    expect_record(outcome, &ty.name, Operation::Create)
  }

  /// Update an existing record.
  ///
  /// Returns the stored record when the remote store echoes it, otherwise the
  /// record as sent. The cached copy is invalidated on success.
  pub async fn update(&self, record: EntityRecord) -> EntityResult<EntityRecord> {
    let ty = self.resolve(&record.entity_type, Operation::Update)?;
    let id = record
      .id(&ty.primary_key)
      .ok_or_else(|| EntityError::MissingId {
        entity_type: ty.name.clone(),
        operation: Operation::Update,
      })?;
    let entity_type = ty.name.clone();
    let cache_key = keys::entity_key(&entity_type, &id);
    // Different payloads for the same entity must not swallow each other.
    let key = RequestKey::new(
      entity_type.as_str(),
      Operation::Update,
      format!("{}#{}", id, keys::content_hash(&record)),
    );

    let request = RemoteRequest::Update {
      entity_type: entity_type.clone(),
      id,
      record: record.clone(),
    };
    let outcome = self
      .join_or_dispatch(key, request, move |inner, response| {
        let mut updated = match response {
          RemoteResponse::Record(echoed) => echoed,
          RemoteResponse::Empty => record,
          other => return Err(unexpected(&entity_type, Operation::Update, &other)),
        };
        inner.invalidate(&entity_type, &cache_key);
        updated.entity_type = entity_type;
        Ok(Outcome::Record(updated))
      })
      .await?;

    expect_record(outcome, &ty.name, Operation::Update)
  }

  /// Delete an entity. The cached copy is invalidated on success.
  pub async fn remove(&self, entity_type: &str, id: impl Into<EntityId>) -> EntityResult<()> {
    let id = id.into();
    let ty = self.resolve(entity_type, Operation::Delete)?;
    let cache_key = keys::entity_key(entity_type, &id);
    let key = RequestKey::new(entity_type, Operation::Delete, id.as_str());

    let type_name = ty.name.clone();
    let request = RemoteRequest::Delete {
      entity_type: type_name.clone(),
      id,
    };
    let outcome = self
      .join_or_dispatch(key, request, move |inner, _response| {
        inner.invalidate(&type_name, &cache_key);
        Ok(Outcome::Removed)
      })
      .await?;

    match outcome {
      Outcome::Removed => Ok(()),
      _ => Err(EntityError::UnexpectedResponse {
        entity_type: entity_type.to_string(),
        operation: Operation::Delete,
        detail: "delete settled with a record".into(),
      }),
    }
  }

  /// Run a listing query.
  ///
  /// Listings are cached under the descriptor's identity. When the query asks
  /// for fully loaded entities, each item is also cached on its own so later
  /// single-entity loads can hit.
  pub async fn list(
    &self,
    entity_type: &str,
    query: &QueryDescriptor,
  ) -> EntityResult<Vec<EntityRecord>> {
    let ty = self.resolve(entity_type, Operation::Index)?;
    let policy = self.policy_for(entity_type);
    let listing_key = keys::listing_key(entity_type, query);
    let key = RequestKey::new(entity_type, Operation::Index, keys::listing_hash(query));

    if policy.enabled && !self.is_in_flight(&key) {
      if let Some(records) = self.inner.cache.get_list(&listing_key) {
        debug!(%key, count = records.len(), "cache hit");
        return Ok(records);
      }
    }

    let entity_type_owned = ty.name.clone();
    let primary_key = ty.primary_key.clone();
    let fully_loaded = query.is_fully_loaded();
    let generation = self
      .inner
      .generations
      .current(&type_generation_key(&entity_type_owned));
    let request = RemoteRequest::Index {
      entity_type: entity_type_owned.clone(),
      query: query.clone(),
    };
    let outcome = self
      .join_or_dispatch(key, request, move |inner, response| {
        let mut records = match response {
          RemoteResponse::Records(records) => records,
          other => return Err(unexpected(&entity_type_owned, Operation::Index, &other)),
        };
        for record in &mut records {
          record.entity_type = entity_type_owned.clone();
        }

        if policy.enabled {
          if fully_loaded {
            // Any write of this type during the call may have outdated an item.
            let generation_key = type_generation_key(&entity_type_owned);
            let seeded = inner.store_unless_written(&generation_key, generation, |cache| {
              for record in &records {
                if let Some(id) = record.id(&primary_key) {
                  cache.put(
                    &keys::entity_key(&entity_type_owned, &id),
                    CachedValue::Record(record.clone()),
                    policy.ttl_secs,
                  );
                }
              }
            });
            if !seeded {
              debug!(entity_type = %entity_type_owned, "type written during listing, not seeding");
            }
          }
          inner
            .cache
            .put(&listing_key, CachedValue::List(records.clone()), policy.ttl_secs);
        }

        Ok(Outcome::Records(records))
      })
      .await?;

    match outcome {
      Outcome::Records(records) => Ok(records),
      _ => Err(EntityError::UnexpectedResponse {
        entity_type: entity_type.to_string(),
        operation: Operation::Index,
        detail: "index settled with a single result".into(),
      }),
    }
  }

  fn resolve(&self, entity_type: &str, operation: Operation) -> EntityResult<&EntityType> {
    let ty = self.inner.registry.resolve(entity_type)?;
    ty.require(operation)?;
    Ok(ty)
  }

  /// Enroll as a waiter on `key`; if this caller leads, issue `request`.
  ///
  /// `complete` turns the remote response into the shared outcome and
  /// applies cache effects before any waiter is woken.
  async fn join_or_dispatch<F>(
    &self,
    key: RequestKey,
    request: RemoteRequest,
    complete: F,
  ) -> EntityResult<Outcome>
  where
    F: FnOnce(&Inner, RemoteResponse) -> EntityResult<Outcome> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let continuation: Continuation<Outcome, EntityError> = Box::new(move |outcome| {
      // Ignore send errors - the caller may have stopped waiting
      let _ = tx.send(outcome);
    });

    match self.inner.pending.enroll(key.clone(), continuation) {
      Enrollment::Leader => self.dispatch(key, request, complete),
      Enrollment::Coalesced => debug!(%key, "joined in-flight request"),
    }

    rx.await.unwrap_or(Err(EntityError::Abandoned))
  }

  fn dispatch<F>(&self, key: RequestKey, request: RemoteRequest, complete: F)
  where
    F: FnOnce(&Inner, RemoteResponse) -> EntityResult<Outcome> + Send + 'static,
  {
    debug!(%key, "dispatching remote call");
    let mut guard = SettleGuard {
      inner: Arc::clone(&self.inner),
      key,
      settled: false,
    };
    let call = self.inner.remote.call(request);

    tokio::spawn(async move {
      let outcome = match call.await {
        Ok(response) => complete(&guard.inner, response),
        Err(e) => Err(EntityError::Remote(e)),
      };
      guard.settle(outcome);
    });
  }
}

/// Settles a dispatched request exactly once, even if the task unwinds.
struct SettleGuard {
  inner: Arc<Inner>,
  key: RequestKey,
  settled: bool,
}

impl SettleGuard {
  fn settle(&mut self, outcome: EntityResult<Outcome>) {
    self.settled = true;
    match outcome {
      Ok(value) => {
        let woken = self.inner.pending.resolve(&self.key, value);
        debug!(key = %self.key, woken, "request resolved");
      }
      Err(e) => {
        let woken = self.inner.pending.reject(&self.key, e.clone());
        warn!(key = %self.key, woken, error = %e, "request failed");
      }
    }
  }
}

impl Drop for SettleGuard {
  fn drop(&mut self) {
    if !self.settled {
      self.settle(Err(EntityError::Abandoned));
    }
  }
}

fn expect_record(
  outcome: Outcome,
  entity_type: &str,
  operation: Operation,
) -> EntityResult<EntityRecord> {
  match outcome {
    Outcome::Record(record) => Ok(record),
    _ => Err(EntityError::UnexpectedResponse {
      entity_type: entity_type.to_string(),
      operation,
      detail: "expected a single record".into(),
    }),
  }
}

fn unexpected(context: &str, operation: Operation, response: &RemoteResponse) -> EntityError {
  let kind = match response {
    RemoteResponse::Record(_) => "record",
    RemoteResponse::Records(_) => "record list",
    RemoteResponse::Created { .. } => "created id",
    RemoteResponse::Empty => "empty body",
  };
  EntityError::UnexpectedResponse {
    entity_type: context.to_string(),
    operation,
    detail: format!("got {}", kind),
  }
}
