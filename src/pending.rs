//! In-flight request table used to coalesce concurrent callers.
//!
//! The first caller for a [`RequestKey`] becomes the [`Enrollment::Leader`]
//! and is responsible for issuing the remote call. Everyone arriving while
//! that call is outstanding is [`Enrollment::Coalesced`]: their continuation
//! is queued and fired, in enrollment order, when the leader's call settles.
//!
//! A settled entry is detached from the table before any continuation runs,
//! and no lock is held while they run. A continuation that enrolls the same
//! key again therefore starts a fresh entry instead of joining the drain in
//! progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::registry::Operation;

/// Identity of a remote operation: (entity type, operation, target).
///
/// `target` is an entity id, a listing hash, or a create-payload hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub entity_type: String,
  pub operation: Operation,
  pub target: String,
}

impl RequestKey {
  pub fn new(
    entity_type: impl Into<String>,
    operation: Operation,
    target: impl Into<String>,
  ) -> Self {
    Self {
      entity_type: entity_type.into(),
      operation,
      target: target.into(),
    }
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.entity_type, self.operation, self.target)
  }
}

/// Callback fired exactly once with the outcome of a request.
pub type Continuation<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// What the caller of [`PendingRequests::enroll`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Enrollment {
  /// Nothing was in flight; the caller must issue the remote call
  Leader,
  /// A call is already outstanding; the caller must not issue another
  Coalesced,
}

/// Table of outstanding requests and their waiting continuations.
pub struct PendingRequests<T, E> {
  entries: Mutex<HashMap<RequestKey, Vec<Continuation<T, E>>>>,
}

impl<T: Clone, E: Clone> PendingRequests<T, E> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn is_in_flight(&self, key: &RequestKey) -> bool {
    self.lock().contains_key(key)
  }

  /// Number of continuations waiting on `key`.
  pub fn waiting(&self, key: &RequestKey) -> usize {
    self.lock().get(key).map_or(0, Vec::len)
  }

  /// Number of distinct requests in flight.
  pub fn in_flight(&self) -> usize {
    self.lock().len()
  }

  /// Queue `continuation` on `key`, creating the entry if nothing is in flight.
  pub fn enroll(&self, key: RequestKey, continuation: Continuation<T, E>) -> Enrollment {
    let mut entries = self.lock();
    match entries.get_mut(&key) {
      Some(waiters) => {
        waiters.push(continuation);
        Enrollment::Coalesced
      }
      None => {
        entries.insert(key, vec![continuation]);
        Enrollment::Leader
      }
    }
  }

  /// Settle `key` successfully. Returns how many continuations were fired.
  pub fn resolve(&self, key: &RequestKey, value: T) -> usize {
    self.settle(key, Ok(value))
  }

  /// Settle `key` with an error. Returns how many continuations were fired.
  pub fn reject(&self, key: &RequestKey, error: E) -> usize {
    self.settle(key, Err(error))
  }

  fn settle(&self, key: &RequestKey, outcome: Result<T, E>) -> usize {
    // Detach under the lock, fire outside it.
    let waiters = self.lock().remove(key).unwrap_or_default();
    let fired = waiters.len();
    for continuation in waiters {
      continuation(outcome.clone());
    }
    fired
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestKey, Vec<Continuation<T, E>>>> {
    // Continuations never run under this lock, so a poisoned table is still consistent.
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Clone, E: Clone> Default for PendingRequests<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> fmt::Debug for PendingRequests<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let in_flight = self
      .entries
      .lock()
      .map(|entries| entries.len())
      .unwrap_or_default();
    f.debug_struct("PendingRequests")
      .field("in_flight", &in_flight)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  type Log = Arc<Mutex<Vec<String>>>;

  fn key(id: &str) -> RequestKey {
    RequestKey::new("widget", Operation::Retrieve, id)
  }

  fn recorder(log: &Log, name: &'static str) -> Continuation<u32, String> {
    let log = log.clone();
    Box::new(move |outcome| {
      let line = match outcome {
        Ok(v) => format!("{}:ok:{}", name, v),
        Err(e) => format!("{}:err:{}", name, e),
      };
      log.lock().unwrap().push(line);
    })
  }

  #[test]
  fn test_first_enrollment_leads_rest_coalesce() {
    let queue: PendingRequests<u32, String> = PendingRequests::new();
    let log = Log::default();

    assert!(!queue.is_in_flight(&key("7")));
    assert_eq!(queue.enroll(key("7"), recorder(&log, "a")), Enrollment::Leader);
    assert_eq!(queue.enroll(key("7"), recorder(&log, "b")), Enrollment::Coalesced);
    assert_eq!(queue.enroll(key("7"), recorder(&log, "c")), Enrollment::Coalesced);

    assert!(queue.is_in_flight(&key("7")));
    assert_eq!(queue.waiting(&key("7")), 3);
    assert_eq!(queue.in_flight(), 1);
  }

  #[test]
  fn test_resolve_fires_in_fifo_order_once() {
    let queue: PendingRequests<u32, String> = PendingRequests::new();
    let log = Log::default();
    let _ = queue.enroll(key("7"), recorder(&log, "a"));
    let _ = queue.enroll(key("7"), recorder(&log, "b"));
    let _ = queue.enroll(key("7"), recorder(&log, "c"));

    assert_eq!(queue.resolve(&key("7"), 42), 3);
    assert_eq!(
      *log.lock().unwrap(),
      vec!["a:ok:42", "b:ok:42", "c:ok:42"]
    );

    assert!(!queue.is_in_flight(&key("7")));
    assert_eq!(queue.resolve(&key("7"), 43), 0);
    assert_eq!(queue.reject(&key("7"), "late".into()), 0);
    assert_eq!(log.lock().unwrap().len(), 3);
  }

  #[test]
  fn test_reject_broadcasts_error() {
    let queue: PendingRequests<u32, String> = PendingRequests::new();
    let log = Log::default();
    let _ = queue.enroll(key("7"), recorder(&log, "a"));
    let _ = queue.enroll(key("7"), recorder(&log, "b"));

    assert_eq!(queue.reject(&key("7"), "503".into()), 2);
    assert_eq!(*log.lock().unwrap(), vec!["a:err:503", "b:err:503"]);
  }

  #[test]
  fn test_keys_are_independent() {
    let queue: PendingRequests<u32, String> = PendingRequests::new();
    let log = Log::default();
    assert_eq!(queue.enroll(key("1"), recorder(&log, "a")), Enrollment::Leader);
    assert_eq!(queue.enroll(key("2"), recorder(&log, "b")), Enrollment::Leader);
    assert_eq!(
      queue.enroll(
        RequestKey::new("widget", Operation::Delete, "1"),
        recorder(&log, "c")
      ),
      Enrollment::Leader
    );

    queue.resolve(&key("2"), 2);
    assert_eq!(*log.lock().unwrap(), vec!["b:ok:2"]);
    assert_eq!(queue.in_flight(), 2);
  }

  #[test]
  fn test_reentrant_enrollment_starts_fresh_entry() {
    let queue: Arc<PendingRequests<u32, String>> = Arc::new(PendingRequests::new());
    let log = Log::default();
    let enrollment = Arc::new(Mutex::new(None));

    let reentrant: Continuation<u32, String> = {
      let queue = queue.clone();
      let log = log.clone();
      let enrollment = enrollment.clone();
      Box::new(move |outcome| {
        log
          .lock()
          .unwrap()
          .push(format!("first:ok:{}", outcome.unwrap()));
        let result = queue.enroll(key("7"), recorder(&log, "second"));
        *enrollment.lock().unwrap() = Some(result);
      })
    };

    let _ = queue.enroll(key("7"), reentrant);
    assert_eq!(queue.resolve(&key("7"), 1), 1);

    // The nested enrollment did not fire during the first drain.
    assert_eq!(*log.lock().unwrap(), vec!["first:ok:1"]);
    assert_eq!(*enrollment.lock().unwrap(), Some(Enrollment::Leader));
    assert_eq!(queue.waiting(&key("7")), 1);

    assert_eq!(queue.resolve(&key("7"), 2), 1);
    assert_eq!(*log.lock().unwrap(), vec!["first:ok:1", "second:ok:2"]);
  }
}
