use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use entity_cache::cache::{ManualClock, MemoryMedium};
use entity_cache::keys;
use entity_cache::{
  CachePolicy, CacheSettings, CacheStore, EntityError, EntityId, EntityRecord, EntityStore,
  EntityType, Operation, QueryDescriptor, RemoteCall, RemoteError, RemoteRequest, RemoteResponse,
  RequestKey, TypeRegistry,
};

enum Reply {
  Ok(RemoteResponse),
  /// Held back until the gate opens
  Gated(watch::Receiver<bool>, RemoteResponse),
  Err(RemoteError),
  Panic,
}

type Responder = Box<dyn Fn(&RemoteRequest) -> Reply + Send + Sync>;

/// Remote double that records every request and yields once before replying.
struct FakeRemote {
  calls: Mutex<Vec<RemoteRequest>>,
  respond: Responder,
}

impl FakeRemote {
  fn new(respond: impl Fn(&RemoteRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
    Arc::new(Self {
      calls: Mutex::new(Vec::new()),
      respond: Box::new(respond),
    })
  }

  fn calls(&self) -> Vec<RemoteRequest> {
    self.calls.lock().unwrap().clone()
  }

  fn count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl RemoteCall for FakeRemote {
  fn call(&self, request: RemoteRequest) -> BoxFuture<'static, Result<RemoteResponse, RemoteError>> {
    let reply = (self.respond)(&request);
    self.calls.lock().unwrap().push(request);
    async move {
      tokio::task::yield_now().await;
      match reply {
        Reply::Ok(response) => Ok(response),
        Reply::Gated(mut gate, response) => {
          let opened = gate.wait_for(|open| *open).await.is_ok();
          if opened {
            Ok(response)
          } else {
            Err(RemoteError::new("transport", "gate dropped"))
          }
        }
        Reply::Err(error) => Err(error),
        Reply::Panic => panic!("remote connection torn down"),
      }
    }
    .boxed()
  }
}

fn widget(id: u64, name: &str) -> EntityRecord {
  EntityRecord::new("widget")
    .with_field("id", id)
    .with_field("name", name)
}

fn registry() -> TypeRegistry {
  let mut registry = TypeRegistry::with_defaults();
  registry.register(EntityType::new("widget", "id"));
  registry
}

fn widget_cache(ttl_secs: u64) -> CacheSettings {
  CacheSettings::disabled().with_type(
    "widget",
    CachePolicy {
      enabled: true,
      ttl_secs,
    },
  )
}

fn store_with(remote: Arc<FakeRemote>, settings: CacheSettings, cache: CacheStore) -> EntityStore {
  EntityStore::new(registry(), settings, cache, remote)
}

fn store(remote: Arc<FakeRemote>, settings: CacheSettings) -> EntityStore {
  store_with(remote, settings, CacheStore::new(MemoryMedium::new()))
}

fn echo_widget(request: &RemoteRequest) -> Reply {
  match request {
    RemoteRequest::Retrieve { id, .. } => {
      let record = EntityRecord::new("widget")
        .with_field("id", id.to_json())
        .with_field("name", "gear");
      Reply::Ok(RemoteResponse::Record(record))
    }
    _ => Reply::Ok(RemoteResponse::Empty),
  }
}

#[tokio::test]
async fn concurrent_loads_share_one_remote_call() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), CacheSettings::disabled());

  let results = join_all((0..5).map(|_| store.load("widget", 7u64))).await;

  assert_eq!(remote.count(), 1);
  let first = results[0].as_ref().unwrap();
  assert_eq!(first.id("id"), Some(EntityId::from(7u64)));
  for result in &results {
    assert_eq!(result.as_ref().unwrap(), first);
  }

  let key = RequestKey::new("widget", Operation::Retrieve, "7");
  assert!(!store.is_in_flight(&key));
}

#[tokio::test]
async fn settled_request_is_not_reused_without_cache() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), CacheSettings::disabled());

  store.load("widget", 7u64).await.unwrap();
  store.load("widget", 7u64).await.unwrap();

  assert_eq!(remote.count(), 2);
}

#[tokio::test]
async fn failure_is_delivered_to_every_waiter() {
  let remote = FakeRemote::new(|_| {
    Reply::Err(RemoteError::new("http", "Service Unavailable").with_status(503))
  });
  let store = store(remote.clone(), widget_cache(60));

  let results = join_all((0..3).map(|_| store.load("widget", 7u64))).await;

  assert_eq!(remote.count(), 1);
  for result in results {
    match result {
      Err(EntityError::Remote(e)) => assert_eq!(e.status, Some(503)),
      other => panic!("expected remote error, got {:?}", other),
    }
  }
  assert!(store
    .cache()
    .get(&keys::entity_key("widget", &EntityId::from(7u64)))
    .is_none());
}

#[tokio::test]
async fn cached_copy_served_until_it_expires() {
  let failing = Arc::new(AtomicBool::new(false));
  let remote = {
    let failing = failing.clone();
    FakeRemote::new(move |request| {
      if failing.load(Ordering::SeqCst) {
        Reply::Err(RemoteError::new("transport", "connection refused"))
      } else {
        echo_widget(request)
      }
    })
  };
  let clock = Arc::new(ManualClock::new(1_000));
  let cache = CacheStore::from_parts(Arc::new(MemoryMedium::new()), clock.clone());
  let store = store_with(remote.clone(), widget_cache(60), cache);

  store.load("widget", 7u64).await.unwrap();
  failing.store(true, Ordering::SeqCst);

  clock.advance(60);
  let hit = store.load("widget", 7u64).await.unwrap();
  assert_eq!(hit.id("id"), Some(EntityId::from(7u64)));
  assert_eq!(remote.count(), 1);

  clock.advance(1);
  let err = store.load("widget", 7u64).await.unwrap_err();
  assert!(matches!(err, EntityError::Remote(_)));
  assert_eq!(remote.count(), 2);
}

#[tokio::test]
async fn zero_ttl_never_expires() {
  let remote = FakeRemote::new(echo_widget);
  let clock = Arc::new(ManualClock::new(0));
  let cache = CacheStore::from_parts(Arc::new(MemoryMedium::new()), clock.clone());
  let store = store_with(remote.clone(), widget_cache(0), cache);

  store.load("widget", 7u64).await.unwrap();
  clock.advance(10 * 365 * 24 * 3600);
  store.load("widget", 7u64).await.unwrap();

  assert_eq!(remote.count(), 1);
}

#[tokio::test]
async fn update_invalidates_cached_entity() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), widget_cache(60));

  store.load("widget", 7u64).await.unwrap();
  store.update(widget(7, "sprocket")).await.unwrap();
  store.load("widget", 7u64).await.unwrap();

  let ops: Vec<Operation> = remote.calls().iter().map(RemoteRequest::operation).collect();
  assert_eq!(
    ops,
    vec![Operation::Retrieve, Operation::Update, Operation::Retrieve]
  );
}

#[tokio::test]
async fn remove_invalidates_cached_entity() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), widget_cache(60));
  let cache_key = keys::entity_key("widget", &EntityId::from(7u64));

  store.load("widget", 7u64).await.unwrap();
  assert!(store.cache().get(&cache_key).is_some());

  store.remove("widget", 7u64).await.unwrap();
  assert!(store.cache().get(&cache_key).is_none());
}

#[tokio::test]
async fn differing_updates_are_not_coalesced() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), CacheSettings::disabled());

  let (a, b) = futures::join!(
    store.update(widget(7, "left")),
    store.update(widget(7, "right"))
  );

  assert_eq!(a.unwrap().field("name").unwrap().as_json(), json!("left"));
  assert_eq!(b.unwrap().field("name").unwrap().as_json(), json!("right"));
  assert_eq!(remote.count(), 2);
}

#[tokio::test]
async fn create_assigns_remote_id() {
  let remote = FakeRemote::new(|request| match request {
    RemoteRequest::Create { .. } => Reply::Ok(RemoteResponse::Created {
      id: EntityId::from(42u64),
      record: None,
    }),
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), widget_cache(60));

  let created = store
    .create(EntityRecord::new("widget").with_field("name", "gear"))
    .await
    .unwrap();

  assert_eq!(created.id("id"), Some(EntityId::from(42u64)));
  assert_eq!(created.field("name").unwrap().as_json(), json!("gear"));
  assert_eq!(created.entity_type, "widget");
}

#[tokio::test]
async fn identical_creates_share_one_call() {
  let remote = FakeRemote::new(|_| {
    Reply::Ok(RemoteResponse::Created {
      id: EntityId::from(42u64),
      record: None,
    })
  });
  let store = store(remote.clone(), CacheSettings::disabled());
  let draft = EntityRecord::new("widget").with_field("name", "gear");

  let results = join_all((0..3).map(|_| store.create(draft.clone()))).await;

  assert_eq!(remote.count(), 1);
  for result in results {
    assert_eq!(result.unwrap().id("id"), Some(EntityId::from(42u64)));
  }
}

#[tokio::test]
async fn listing_pages_are_distinct() {
  let remote = FakeRemote::new(|request| match request {
    RemoteRequest::Index { query, .. } => {
      let base = u64::from(query.page_index().unwrap_or(0)) * 10;
      Reply::Ok(RemoteResponse::Records(vec![widget(base + 1, "a"), widget(base + 2, "b")]))
    }
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), widget_cache(60));
  let page0 = QueryDescriptor::new().page_size(2).page(0);
  let page1 = QueryDescriptor::new().page_size(2).page(1);

  let first = store.list("widget", &page0).await.unwrap();
  let second = store.list("widget", &page1).await.unwrap();
  assert_ne!(first, second);
  assert_eq!(remote.count(), 2);

  // Both pages are now cached independently.
  assert_eq!(store.list("widget", &page0).await.unwrap(), first);
  assert_eq!(store.list("widget", &page1).await.unwrap(), second);
  assert_eq!(remote.count(), 2);
}

#[tokio::test]
async fn full_listing_seeds_entity_cache() {
  let remote = FakeRemote::new(|request| match request {
    RemoteRequest::Index { .. } => Reply::Ok(RemoteResponse::Records(vec![
      widget(1, "a"),
      widget(2, "b"),
    ])),
    other => echo_widget(other),
  });
  let store = store(remote.clone(), widget_cache(60));
  let query = QueryDescriptor::new().load_entities(true);

  store.list("widget", &query).await.unwrap();
  let loaded = store.load("widget", 2u64).await.unwrap();

  assert_eq!(loaded.field("name").unwrap().as_json(), json!("b"));
  assert_eq!(remote.count(), 1);
}

#[tokio::test]
async fn unknown_type_never_reaches_remote() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), CacheSettings::enabled(60));

  let err = store.load("gadget", 1u64).await.unwrap_err();
  assert_eq!(err, EntityError::UnsupportedType("gadget".into()));

  let err = store
    .list("gadget", &QueryDescriptor::new())
    .await
    .unwrap_err();
  assert_eq!(err, EntityError::UnsupportedType("gadget".into()));

  assert_eq!(remote.count(), 0);
}

#[tokio::test]
async fn torn_down_call_abandons_waiters() {
  let broken = Arc::new(AtomicBool::new(true));
  let remote = {
    let broken = broken.clone();
    FakeRemote::new(move |request| {
      if broken.load(Ordering::SeqCst) {
        Reply::Panic
      } else {
        echo_widget(request)
      }
    })
  };
  let store = store(remote.clone(), CacheSettings::disabled());

  let results = join_all((0..3).map(|_| store.load("widget", 7u64))).await;
  assert_eq!(remote.count(), 1);
  for result in results {
    assert_eq!(result.unwrap_err(), EntityError::Abandoned);
  }

  // The key is free again once abandoned.
  broken.store(false, Ordering::SeqCst);
  assert!(store.load("widget", 7u64).await.is_ok());
  assert_eq!(remote.count(), 2);
}

async fn until_in_flight(store: &EntityStore, key: &RequestKey) {
  while !store.is_in_flight(key) {
    tokio::task::yield_now().await;
  }
}

#[tokio::test]
async fn identical_listings_share_one_call() {
  let remote = FakeRemote::new(|_| Reply::Ok(RemoteResponse::Records(vec![widget(1, "a")])));
  let store = store(remote.clone(), CacheSettings::disabled());
  let query = QueryDescriptor::new().page(0).page_size(10);

  let results = join_all((0..4).map(|_| store.list("widget", &query))).await;

  assert_eq!(remote.count(), 1);
  for result in results {
    assert_eq!(result.unwrap(), vec![widget(1, "a")]);
  }
}

#[tokio::test]
async fn concurrent_pages_are_independent_calls() {
  let remote = FakeRemote::new(|request| match request {
    RemoteRequest::Index { query, .. } => {
      let id = u64::from(query.page_index().unwrap_or(0));
      Reply::Ok(RemoteResponse::Records(vec![widget(id, "page")]))
    }
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), CacheSettings::disabled());
  let page0 = QueryDescriptor::new().page(0);
  let page1 = QueryDescriptor::new().page(1);

  let (first, second) = futures::join!(store.list("widget", &page0), store.list("widget", &page1));

  assert_eq!(remote.count(), 2);
  assert_eq!(first.unwrap(), vec![widget(0, "page")]);
  assert_eq!(second.unwrap(), vec![widget(1, "page")]);
}

#[tokio::test]
async fn concurrent_removes_share_one_call() {
  let remote = FakeRemote::new(echo_widget);
  let store = store(remote.clone(), widget_cache(60));

  let (a, b) = futures::join!(store.remove("widget", 7u64), store.remove("widget", 7u64));

  assert!(a.is_ok());
  assert!(b.is_ok());
  assert_eq!(remote.count(), 1);
  assert_eq!(remote.calls()[0].operation(), Operation::Delete);
}

#[tokio::test]
async fn retrieve_overtaken_by_update_is_not_cached() {
  let (open, gate) = watch::channel(false);
  let remote = FakeRemote::new(move |request| match request {
    RemoteRequest::Retrieve { .. } => {
      Reply::Gated(gate.clone(), RemoteResponse::Record(widget(7, "old")))
    }
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), widget_cache(60));
  let cache_key = keys::entity_key("widget", &EntityId::from(7u64));

  let reader = tokio::spawn({
    let store = store.clone();
    async move { store.load("widget", 7u64).await }
  });
  until_in_flight(&store, &RequestKey::new("widget", Operation::Retrieve, "7")).await;

  store.update(widget(7, "new")).await.unwrap();
  open.send(true).unwrap();

  // The reader still gets what it asked for, but the old copy is not kept.
  let read = reader.await.unwrap().unwrap();
  assert_eq!(read.field("name").unwrap().as_json(), json!("old"));
  assert!(store.cache().get(&cache_key).is_none());

  // Later reads cache normally again.
  store.load("widget", 7u64).await.unwrap();
  assert!(store.cache().get(&cache_key).is_some());
}

#[tokio::test]
async fn retrieve_overtaken_by_remove_is_not_cached() {
  let (open, gate) = watch::channel(false);
  let remote = FakeRemote::new(move |request| match request {
    RemoteRequest::Retrieve { .. } => {
      Reply::Gated(gate.clone(), RemoteResponse::Record(widget(7, "old")))
    }
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), widget_cache(60));

  let reader = tokio::spawn({
    let store = store.clone();
    async move { store.load("widget", 7u64).await }
  });
  until_in_flight(&store, &RequestKey::new("widget", Operation::Retrieve, "7")).await;

  store.remove("widget", 7u64).await.unwrap();
  open.send(true).unwrap();
  reader.await.unwrap().unwrap();

  assert!(store
    .cache()
    .get(&keys::entity_key("widget", &EntityId::from(7u64)))
    .is_none());
}

#[tokio::test]
async fn full_listing_overtaken_by_write_does_not_seed() {
  let (open, gate) = watch::channel(false);
  let remote = FakeRemote::new(move |request| match request {
    RemoteRequest::Index { .. } => Reply::Gated(
      gate.clone(),
      RemoteResponse::Records(vec![widget(1, "a"), widget(2, "old")]),
    ),
    _ => Reply::Ok(RemoteResponse::Empty),
  });
  let store = store(remote.clone(), widget_cache(60));
  let query = QueryDescriptor::new().load_entities(true);

  let lister = tokio::spawn({
    let store = store.clone();
    let query = query.clone();
    async move { store.list("widget", &query).await }
  });
  let key = RequestKey::new("widget", Operation::Index, keys::listing_hash(&query));
  until_in_flight(&store, &key).await;

  store.update(widget(2, "new")).await.unwrap();
  open.send(true).unwrap();
  assert_eq!(lister.await.unwrap().unwrap().len(), 2);

  assert!(store
    .cache()
    .get(&keys::entity_key("widget", &EntityId::from(2u64)))
    .is_none());
}
