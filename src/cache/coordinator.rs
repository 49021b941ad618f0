//! Entity cache coordinator.
//!
//! Sits between dashboard views and the backend transport. Reads go through
//! a freshness check, then list adoption, then a single de-duplicated
//! network fetch. Writes patch exactly the affected entry and reach list
//! views only through explicit subscriptions.

use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::entity::{Entity, SortSpec};
use super::keys::{CacheKey, EntityId, EntityKind, ListKey};
use super::storage::{
  lock_state, CacheEntry, CacheState, Flight, ListCache, ListPolicy, SharedFetch, WriteEffect,
};
use super::traits::{CacheResult, Mutation, MutationOutcome, Transport};
use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::event::{CacheEvent, EventBus};

type SessionHook = Arc<dyn Fn() + Send + Sync>;

/// Point-in-time counters, mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
  pub entries: usize,
  pub lists: usize,
  pub in_flight: usize,
}

struct Inner<T> {
  transport: T,
  config: CacheConfig,
  state: Mutex<CacheState>,
  events: EventBus,
  session_hook: Mutex<Option<SessionHook>>,
}

/// Session-scoped cache over a [`Transport`].
///
/// Cloning is cheap and every clone shares the same cache. Construct one per
/// signed-in session and call [`Coordinator::teardown`] on sign-out.
pub struct Coordinator<T: Transport> {
  inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Coordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Transport> Coordinator<T> {
  pub fn new(transport: T, config: CacheConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        transport,
        config,
        state: Mutex::new(CacheState::default()),
        events: EventBus::default(),
        session_hook: Mutex::new(None),
      }),
    }
  }

  /// Install the global side effect run when the backend rejects our
  /// credentials. Replaces any previous hook.
  pub fn on_session_expired<F>(&self, hook: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    let mut slot = self
      .inner
      .session_hook
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(Arc::new(hook));
  }

  /// Subscribe to cache notifications.
  pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  pub fn transport(&self) -> &T {
    &self.inner.transport
  }

  /// Get an entity, hitting the network only when no usable copy exists.
  ///
  /// 1. Fresh entry - return immediately
  /// 2. No entry - adopt a detail item from a fresh list of the same kind
  /// 3. Otherwise join or start the single in-flight fetch for the key
  ///
  /// If a stale entry exists and the refetch fails with a network error,
  /// the stale entry is returned as [`CacheSource::Offline`](super::CacheSource::Offline).
  pub async fn get_or_fetch(
    &self,
    kind: EntityKind,
    id: impl Into<EntityId>,
  ) -> Result<CacheResult<Entity>, FetchError> {
    let key = CacheKey::new(kind, id);

    let (flight, stale) = {
      let mut state = lock_state(&self.inner.state, "get_or_fetch");

      let stale = match state.entries.get(&key) {
        Some(entry) if !entry.is_stale() => {
          debug!(key = %key, "cache hit");
          return Ok(CacheResult::from_cache(
            entry.value.clone(),
            entry.cached_at,
          ));
        }
        Some(entry) => Some((entry.value.clone(), entry.cached_at)),
        None => None,
      };

      if stale.is_none() {
        if let Some(entry) = state.adopt_from_lists(&key) {
          drop(state);
          debug!(key = %key, "adopted detail from cached list");
          self.inner.events.emit(CacheEvent::EntityStored(key));
          return Ok(CacheResult::from_list(entry.value, entry.cached_at));
        }
      }

      (self.entity_flight(&mut state, &key), stale)
    };

    match (flight.await, stale) {
      (Ok(entity), _) => Ok(CacheResult::from_network(entity)),
      (Err(FetchError::Network(msg)), Some((value, cached_at))) => {
        warn!(key = %key, error = %msg, "refetch failed, serving stale entry");
        Ok(CacheResult::offline(value, cached_at))
      }
      (Err(err), _) => Err(err),
    }
  }

  /// Get a collection view, refetching when missing or stale.
  pub async fn fetch_list(&self, key: &ListKey) -> Result<CacheResult<Vec<Entity>>, FetchError> {
    let (flight, stale) = {
      let mut state = lock_state(&self.inner.state, "fetch_list");

      let stale = match state.lists.get(key) {
        Some(list) if !list.is_stale() => {
          debug!(list = %key, "list cache hit");
          return Ok(CacheResult::from_cache(list.items.clone(), list.cached_at));
        }
        Some(list) => Some((list.items.clone(), list.cached_at)),
        None => None,
      };

      (self.list_flight(&mut state, key), stale)
    };

    match (flight.await, stale) {
      (Ok(items), _) => Ok(CacheResult::from_network(items)),
      (Err(FetchError::Network(msg)), Some((items, cached_at))) => {
        warn!(list = %key, error = %msg, "list refetch failed, serving stale list");
        Ok(CacheResult::offline(items, cached_at))
      }
      (Err(err), _) => Err(err),
    }
  }

  /// Cached list items in client-side order. The cached list keeps server
  /// order.
  pub fn sorted_list(&self, key: &ListKey, sort: &SortSpec) -> Option<Vec<Entity>> {
    let mut items = {
      let state = lock_state(&self.inner.state, "sorted_list");
      state.lists.get(key)?.items.clone()
    };
    sort.apply(&mut items);
    Some(items)
  }

  /// Snapshot of a cached entry, fresh or not, without any I/O.
  pub fn peek(&self, kind: EntityKind, id: impl Into<EntityId>) -> Option<Entity> {
    let key = CacheKey::new(kind, id);
    let state = lock_state(&self.inner.state, "peek");
    state.entries.get(&key).map(|entry| entry.value.clone())
  }

  /// Create an entity and cache the server's representation of it.
  pub async fn create(&self, kind: EntityKind, body: Value) -> Result<Entity, FetchError> {
    info!(kind = %kind, "creating entity");

    let entity = match self.inner.transport.create(kind, &body).await {
      Ok(entity) => entity,
      Err(err) => return Err(self.inner.write_failed(kind.as_str(), err)),
    };

    let key = entity.key();
    let touched = {
      let mut state = lock_state(&self.inner.state, "create");
      state.tombstones.remove(&key);
      state.entries.insert(
        key.clone(),
        CacheEntry::written(entity.clone(), self.inner.config.stale_after(kind)),
      );
      state.touch_subscribed_lists(kind, &key.id, WriteEffect::Created)
    };

    self.inner.events.emit(CacheEvent::EntityStored(key));
    self.inner.emit_lists(touched);
    Ok(entity)
  }

  /// Apply a write to one entity.
  ///
  /// On success the entry for `(kind, id)` is replaced (or removed for a
  /// delete) before this returns, so a following [`get_or_fetch`] observes
  /// it. Writes are never retried and a failed write leaves the cache as it
  /// was. Returns the saved entity when the server sent one back.
  ///
  /// [`get_or_fetch`]: Coordinator::get_or_fetch
  pub async fn mutate(
    &self,
    kind: EntityKind,
    id: impl Into<EntityId>,
    mutation: Mutation,
  ) -> Result<Option<Entity>, FetchError> {
    let key = CacheKey::new(kind, id);
    info!(key = %key, mutation = mutation.label(), "sending mutation");

    let outcome = match self.inner.transport.send_mutation(&key, &mutation).await {
      Ok(outcome) => outcome,
      Err(err) => return Err(self.inner.write_failed(&key.to_string(), err)),
    };

    let mut state = lock_state(&self.inner.state, "mutate");
    // Any fetch started before the write would resolve with older data
    state.entity_flights.remove(&key);

    match outcome {
      MutationOutcome::Saved(entity) => {
        state.tombstones.remove(&key);
        state.entries.insert(
          key.clone(),
          CacheEntry::written(entity.clone(), self.inner.config.stale_after(kind)),
        );
        let touched = state.touch_subscribed_lists(kind, &key.id, WriteEffect::Changed);
        drop(state);

        self.inner.events.emit(CacheEvent::EntityStored(key));
        self.inner.emit_lists(touched);
        Ok(Some(entity))
      }
      MutationOutcome::Deleted => {
        state.entries.remove(&key);
        state.tombstones.insert(key.clone());
        let touched = state.touch_subscribed_lists(kind, &key.id, WriteEffect::Deleted);
        drop(state);

        info!(key = %key, "entity deleted");
        self.inner.events.emit(CacheEvent::EntityRemoved(key));
        self.inner.emit_lists(touched);
        Ok(None)
      }
      MutationOutcome::Accepted => {
        if let Some(entry) = state.entries.get_mut(&key) {
          entry.invalidated = true;
        }
        let touched = state.touch_subscribed_lists(kind, &key.id, WriteEffect::Changed);
        drop(state);

        self.inner.emit_lists(touched);
        Ok(None)
      }
    }
  }

  /// Opt a cached list into reacting to writes of its kind.
  pub fn subscribe_list(&self, key: ListKey, policy: ListPolicy) {
    debug!(list = %key, ?policy, "list subscribed to writes");
    let mut state = lock_state(&self.inner.state, "subscribe_list");
    state.subscriptions.insert(key, policy);
  }

  pub fn unsubscribe_list(&self, key: &ListKey) {
    let mut state = lock_state(&self.inner.state, "unsubscribe_list");
    state.subscriptions.remove(key);
  }

  /// Mark one entity stale; the next read refetches it.
  pub fn invalidate(&self, kind: EntityKind, id: impl Into<EntityId>) {
    let key = CacheKey::new(kind, id);
    let mut state = lock_state(&self.inner.state, "invalidate");
    if let Some(entry) = state.entries.get_mut(&key) {
      debug!(key = %key, "entry invalidated");
      entry.invalidated = true;
    }
  }

  /// Mark one list stale; the next read refetches it.
  pub fn invalidate_list(&self, key: &ListKey) {
    let found = {
      let mut state = lock_state(&self.inner.state, "invalidate_list");
      match state.lists.get_mut(key) {
        Some(list) => {
          list.invalidated = true;
          true
        }
        None => false,
      }
    };
    if found {
      debug!(list = %key, "list invalidated");
      self.inner.events.emit(CacheEvent::ListInvalidated(key.clone()));
    }
  }

  /// Mark every entry and list of `kind` stale.
  pub fn invalidate_kind(&self, kind: EntityKind) {
    let lists = {
      let mut state = lock_state(&self.inner.state, "invalidate_kind");
      state.invalidate_kind(kind)
    };
    debug!(kind = %kind, lists = lists.len(), "kind invalidated");
    self.inner.emit_lists(lists);
  }

  /// Drop every entry, list, subscription and in-flight registration.
  ///
  /// Safe to call repeatedly. Fetches still running finish for their
  /// callers but no longer write to the cache.
  pub fn teardown(&self) {
    self.inner.clear("teardown");
  }

  pub fn stats(&self) -> CacheStats {
    let state = lock_state(&self.inner.state, "stats");
    CacheStats {
      entries: state.entries.len(),
      lists: state.lists.len(),
      in_flight: state.in_flight(),
    }
  }

  /// Join the registered fetch for `key`, or register a new one.
  fn entity_flight(&self, state: &mut CacheState, key: &CacheKey) -> SharedFetch<Entity> {
    if let Some(flight) = state.entity_flights.get(key) {
      debug!(key = %key, "joining in-flight fetch");
      return flight.future.clone();
    }

    let ticket = state.issue_ticket();
    let inner = Arc::clone(&self.inner);
    let owned_key = key.clone();
    let future = async move { inner.run_entity_fetch(owned_key, ticket).await }
      .boxed()
      .shared();

    state.entity_flights.insert(
      key.clone(),
      Flight {
        ticket,
        future: future.clone(),
      },
    );
    future
  }

  fn list_flight(&self, state: &mut CacheState, key: &ListKey) -> SharedFetch<Vec<Entity>> {
    if let Some(flight) = state.list_flights.get(key) {
      debug!(list = %key, "joining in-flight list fetch");
      return flight.future.clone();
    }

    let ticket = state.issue_ticket();
    let inner = Arc::clone(&self.inner);
    let owned_key = key.clone();
    let future = async move { inner.run_list_fetch(owned_key, ticket).await }
      .boxed()
      .shared();

    state.list_flights.insert(
      key.clone(),
      Flight {
        ticket,
        future: future.clone(),
      },
    );
    future
  }
}

impl<T: Transport> Inner<T> {
  async fn run_entity_fetch(&self, key: CacheKey, ticket: u64) -> Result<Entity, FetchError> {
    info!(key = %key, "fetching entity");
    let what = key.to_string();
    let result = self
      .retry_read(&what, || self.transport.fetch_entity(&key))
      .await;

    let mut state = lock_state(&self.state, "run_entity_fetch");
    if !state.entity_flight_is_current(&key, ticket) {
      debug!(key = %key, "discarding superseded fetch result");
      return result;
    }
    state.entity_flights.remove(&key);

    match &result {
      Ok(entity) => {
        state.tombstones.remove(&key);
        state.entries.insert(
          key.clone(),
          CacheEntry::new(entity.clone(), self.config.stale_after(key.kind)),
        );
        drop(state);
        self.events.emit(CacheEvent::EntityStored(key));
      }
      Err(FetchError::NotFound { .. }) => {
        let removed = state.entries.remove(&key).is_some();
        drop(state);
        if removed {
          self.events.emit(CacheEvent::EntityRemoved(key));
        }
      }
      Err(FetchError::Auth { status }) => {
        drop(state);
        warn!(key = %key, status, "fetch rejected credentials");
        self.expire_session();
      }
      Err(err) => {
        warn!(key = %key, error = %err, "fetch failed");
      }
    }

    result
  }

  async fn run_list_fetch(&self, key: ListKey, ticket: u64) -> Result<Vec<Entity>, FetchError> {
    info!(list = %key, "fetching list");
    let what = key.description();
    let result = self
      .retry_read(&what, || self.transport.fetch_list(&key))
      .await;

    let mut state = lock_state(&self.state, "run_list_fetch");
    if !state.list_flight_is_current(&key, ticket) {
      debug!(list = %key, "discarding superseded list result");
      return result;
    }
    state.list_flights.remove(&key);

    match &result {
      Ok(items) => {
        state.lists.insert(
          key.clone(),
          ListCache::new(items.clone(), self.config.stale_after(key.kind)),
        );
        drop(state);
        debug!(list = %key, items = items.len(), "list stored");
        self.events.emit(CacheEvent::ListStored(key));
      }
      Err(FetchError::Auth { status }) => {
        drop(state);
        warn!(list = %key, status, "list fetch rejected credentials");
        self.expire_session();
      }
      Err(err) => {
        warn!(list = %key, error = %err, "list fetch failed");
      }
    }

    result
  }

  /// Run a read, retrying network failures with exponential backoff.
  async fn retry_read<V, F, Fut>(&self, what: &str, mut op: F) -> Result<V, FetchError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<V, FetchError>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Err(err) if err.is_retryable() && attempt < self.config.read_retries => {
          let delay = self.config.retry_delay(attempt);
          attempt += 1;
          warn!(what, attempt, ?delay, error = %err, "read failed, retrying");
          tokio::time::sleep(delay).await;
        }
        other => return other,
      }
    }
  }

  /// Log a failed write and run the session side effect for auth failures.
  fn write_failed(&self, what: &str, err: FetchError) -> FetchError {
    warn!(what, error = %err, "mutation failed");
    if err.is_auth() {
      self.expire_session();
    }
    err
  }

  fn expire_session(&self) {
    warn!("session rejected by backend, tearing down cache");
    self.clear("session_expired");
    self.events.emit(CacheEvent::SessionExpired);

    let hook = self
      .session_hook
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone();
    if let Some(hook) = hook {
      hook();
    }
  }

  fn clear(&self, op: &'static str) {
    let stats = {
      let mut state = lock_state(&self.state, op);
      let stats = (state.entries.len(), state.lists.len(), state.in_flight());
      state.clear();
      stats
    };
    info!(
      op,
      entries = stats.0,
      lists = stats.1,
      in_flight = stats.2,
      "cache cleared"
    );
    self.events.emit(CacheEvent::Cleared);
  }

  fn emit_lists(&self, keys: Vec<ListKey>) {
    for key in keys {
      self.events.emit(CacheEvent::ListInvalidated(key));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FakeTransport;
  use crate::cache::CacheSource;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  /// Default freshness windows, without retry delays.
  fn config() -> CacheConfig {
    CacheConfig::default().with_retries(2, 0)
  }

  fn coordinator(transport: FakeTransport) -> Coordinator<FakeTransport> {
    Coordinator::new(transport, config())
  }

  fn trip(id: i64, name: &str) -> Entity {
    Entity::detail(EntityKind::Trip, id, json!({"id": id, "name": name, "description": "..."}))
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_fetch() {
    let transport = FakeTransport::new().with_delay(Duration::from_millis(50));
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    let (a, b, c) = tokio::join!(
      cache.get_or_fetch(EntityKind::Trip, 1),
      cache.get_or_fetch(EntityKind::Trip, 1),
      cache.get_or_fetch(EntityKind::Trip, 1),
    );

    assert_eq!(cache.transport().entity_calls(), 1);
    for result in [a, b, c] {
      assert_eq!(result.unwrap().data, trip(1, "Petra"));
    }
    assert_eq!(cache.stats().in_flight, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_served_without_io() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    let first = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    let second = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(cache.transport().entity_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_refetched_exactly_once() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;

    let refreshed = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(refreshed.source, CacheSource::Network);
    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();

    assert_eq!(cache.transport().entity_calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_is_read_back_without_io() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 1),
      Ok(MutationOutcome::Saved(trip(1, "Petra by night"))),
    );
    let cache = coordinator(transport);

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    let saved = cache
      .mutate(
        EntityKind::Trip,
        1,
        Mutation::Update(json!({"name": "Petra by night"})),
      )
      .await
      .unwrap();
    assert_eq!(saved, Some(trip(1, "Petra by night")));

    let read = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(read.data, trip(1, "Petra by night"));
    assert_eq!(read.source, CacheSource::CacheFresh);
    assert_eq!(cache.transport().entity_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_user_write_read_back_despite_zero_window() {
    let user = |name: &str| {
      Entity::detail(EntityKind::User, 5, json!({"id": 5, "name": name, "profile": {}}))
    };
    let transport = FakeTransport::new();
    transport.put_entity(user("Rania"));
    transport.put_mutation(
      CacheKey::new(EntityKind::User, 5),
      Ok(MutationOutcome::Saved(user("Rania A."))),
    );
    let cache = Coordinator::new(transport, CacheConfig::default());

    cache.get_or_fetch(EntityKind::User, 5).await.unwrap();
    cache
      .mutate(EntityKind::User, 5, Mutation::Update(json!({"name": "Rania A."})))
      .await
      .unwrap();

    let read = cache.get_or_fetch(EntityKind::User, 5).await.unwrap();
    assert_eq!(read.source, CacheSource::CacheFresh);
    assert_eq!(read.data, user("Rania A."));
    assert_eq!(cache.transport().entity_calls(), 1);

    // Until something invalidates it
    cache.invalidate(EntityKind::User, 5);
    let read = cache.get_or_fetch(EntityKind::User, 5).await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(cache.transport().entity_calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_supersedes_fetch_in_flight() {
    let transport = FakeTransport::new().with_delay(Duration::from_millis(100));
    transport.put_entity(trip(1, "Petra"));
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 1),
      Ok(MutationOutcome::Saved(trip(1, "Petra II"))),
    );
    let cache = coordinator(transport);

    // The read starts after the write but its response lands last
    let (written, read) = tokio::join!(
      cache.mutate(EntityKind::Trip, 1, Mutation::Update(json!({"name": "Petra II"}))),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get_or_fetch(EntityKind::Trip, 1).await
      },
    );

    assert_eq!(written.unwrap(), Some(trip(1, "Petra II")));
    assert_eq!(read.unwrap().data, trip(1, "Petra"));
    assert_eq!(cache.stats().in_flight, 0);

    let after = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(after.source, CacheSource::CacheFresh);
    assert_eq!(after.data, trip(1, "Petra II"));
    assert_eq!(cache.transport().entity_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_mutation_leaves_entry_untouched() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 1),
      Err(FetchError::Network("503".to_string())),
    );
    let cache = coordinator(transport);

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    let err = cache
      .mutate(EntityKind::Trip, 1, Mutation::Update(json!({"name": "x"})))
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Network(_)));
    // Writes are not retried
    assert_eq!(cache.transport().mutation_calls(), 1);
    assert_eq!(cache.peek(EntityKind::Trip, 1), Some(trip(1, "Petra")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_list_detail_items_are_adopted() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(
      list_key.clone(),
      vec![
        Entity::summary(EntityKind::Trip, 1, json!({"id": 1, "name": "Wadi Rum"})),
        trip(2, "Dead Sea"),
      ],
    );
    transport.put_entity(trip(1, "Wadi Rum"));
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();

    let adopted = cache.get_or_fetch(EntityKind::Trip, 2).await.unwrap();
    assert_eq!(adopted.source, CacheSource::ListSeed);
    assert_eq!(adopted.data, trip(2, "Dead Sea"));
    assert_eq!(cache.transport().entity_calls(), 0);

    let fetched = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(fetched.source, CacheSource::Network);
    assert_eq!(cache.transport().entity_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_string_id_adopts_numeric_list_item() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(list_key.clone(), vec![trip(2, "Dead Sea")]);
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    let adopted = cache
      .get_or_fetch(EntityKind::Trip, EntityId::try_from("2").unwrap())
      .await
      .unwrap();

    assert_eq!(adopted.source, CacheSource::ListSeed);
    assert_eq!(cache.transport().entity_calls(), 0);
    assert_eq!(cache.peek(EntityKind::Trip, 2), Some(trip(2, "Dead Sea")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_list_reads_share_one_fetch() {
    let transport = FakeTransport::new().with_delay(Duration::from_millis(50));
    let list_key = ListKey::new(EntityKind::Event).with_filter("status", "active");
    let event = Entity::summary(EntityKind::Event, 1, json!({"id": 1, "title": "Jerash"}));
    transport.put_list(list_key.clone(), vec![event.clone()]);
    let cache = coordinator(transport);

    let (a, b, c) = tokio::join!(
      cache.fetch_list(&list_key),
      cache.fetch_list(&list_key),
      cache.fetch_list(&list_key),
    );

    assert_eq!(cache.transport().list_calls(), 1);
    for result in [a, b, c] {
      assert_eq!(result.unwrap().data, vec![event.clone()]);
    }
    assert_eq!(cache.stats().in_flight, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_detail_edits_never_written_into_lists() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(list_key.clone(), vec![trip(2, "Dead Sea")]);
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 2),
      Ok(MutationOutcome::Saved(trip(2, "Dead Sea spa"))),
    );
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    cache
      .mutate(EntityKind::Trip, 2, Mutation::Update(json!({"name": "Dead Sea spa"})))
      .await
      .unwrap();

    let list = cache.fetch_list(&list_key).await.unwrap();
    assert_eq!(list.source, CacheSource::CacheFresh);
    assert_eq!(list.data, vec![trip(2, "Dead Sea")]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_auth_failure_expires_session_once() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    transport.put_entity_error(
      CacheKey::new(EntityKind::User, 5),
      FetchError::Auth { status: 401 },
    );
    let cache = coordinator(transport.with_delay(Duration::from_millis(10)));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    cache.on_session_expired(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(cache.stats().entries, 1);

    let (a, b) = tokio::join!(
      cache.get_or_fetch(EntityKind::User, 5),
      cache.get_or_fetch(EntityKind::User, 5),
    );

    assert_eq!(a.unwrap_err(), FetchError::Auth { status: 401 });
    assert_eq!(b.unwrap_err(), FetchError::Auth { status: 401 });
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats(), CacheStats::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_deleted_entity_is_refetched_and_not_found_propagates() {
    let transport = FakeTransport::new();
    let event = Entity::detail(EntityKind::Event, 9, json!({"id": 9, "description": "Jerash"}));
    let list_key = ListKey::new(EntityKind::Event);
    transport.put_entity(event.clone());
    transport.put_list(list_key.clone(), vec![event]);
    transport.put_mutation(
      CacheKey::new(EntityKind::Event, 9),
      Ok(MutationOutcome::Deleted),
    );
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    cache.get_or_fetch(EntityKind::Event, 9).await.unwrap();
    assert_eq!(
      cache.mutate(EntityKind::Event, 9, Mutation::Delete).await,
      Ok(None)
    );

    cache.transport().put_entity_error(
      CacheKey::new(EntityKind::Event, 9),
      FetchError::not_found(&CacheKey::new(EntityKind::Event, 9)),
    );
    let err = cache.get_or_fetch(EntityKind::Event, 9).await.unwrap_err();

    assert_eq!(
      err,
      FetchError::NotFound {
        kind: EntityKind::Event,
        id: Some(EntityId::Int(9)),
      }
    );
    assert_eq!(cache.transport().entity_calls(), 1);
    assert!(cache.peek(EntityKind::Event, 9).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_splice_subscription_removes_deleted_item() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip).with_filter("status", "active");
    transport.put_list(list_key.clone(), vec![trip(1, "Petra"), trip(2, "Aqaba")]);
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 2),
      Ok(MutationOutcome::Deleted),
    );
    let cache = coordinator(transport);
    let mut events = cache.events();

    cache.fetch_list(&list_key).await.unwrap();
    cache.subscribe_list(list_key.clone(), ListPolicy::Splice);
    cache.mutate(EntityKind::Trip, 2, Mutation::Delete).await.unwrap();

    let list = cache.fetch_list(&list_key).await.unwrap();
    assert_eq!(list.source, CacheSource::CacheFresh);
    assert_eq!(list.data, vec![trip(1, "Petra")]);
    assert_eq!(cache.transport().list_calls(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert!(seen.contains(&CacheEvent::ListInvalidated(list_key)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_subscription_refetches_list() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(list_key.clone(), vec![trip(1, "Petra")]);
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 1),
      Ok(MutationOutcome::Saved(trip(1, "Petra II"))),
    );
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    cache.subscribe_list(list_key.clone(), ListPolicy::Invalidate);
    cache
      .mutate(EntityKind::Trip, 1, Mutation::Update(json!({"name": "Petra II"})))
      .await
      .unwrap();

    let list = cache.fetch_list(&list_key).await.unwrap();
    assert_eq!(list.source, CacheSource::Network);
    assert_eq!(cache.transport().list_calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribed_list_untouched_by_writes() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(list_key.clone(), vec![trip(1, "Petra")]);
    transport.put_mutation(
      CacheKey::new(EntityKind::Trip, 1),
      Ok(MutationOutcome::Deleted),
    );
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    cache.mutate(EntityKind::Trip, 1, Mutation::Delete).await.unwrap();

    let list = cache.fetch_list(&list_key).await.unwrap();
    assert_eq!(list.source, CacheSource::CacheFresh);
    assert_eq!(list.data.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_failure_serves_stale_entry() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    cache.invalidate(EntityKind::Trip, 1);
    cache.transport().put_entity_error(
      CacheKey::new(EntityKind::Trip, 1),
      FetchError::Network("connection reset".to_string()),
    );

    let result = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, trip(1, "Petra"));
    // One initial fetch, then one attempt plus two retries
    assert_eq!(cache.transport().entity_calls(), 4);
    assert_eq!(cache.peek(EntityKind::Trip, 1), Some(trip(1, "Petra")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reads_retry_network_errors_twice() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    transport.fail_next_fetches(2);
    let cache = coordinator(transport);

    let result = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    assert_eq!(result.data, trip(1, "Petra"));
    assert_eq!(cache.transport().entity_calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_are_bounded() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    transport.fail_next_fetches(3);
    let cache = coordinator(transport);

    let err = cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
    assert_eq!(cache.transport().entity_calls(), 3);
    assert!(cache.peek(EntityKind::Trip, 1).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_teardown_is_idempotent() {
    let transport = FakeTransport::new();
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    cache.teardown();
    assert_eq!(cache.stats(), CacheStats::default());

    cache.get_or_fetch(EntityKind::Trip, 1).await.unwrap();
    cache.teardown();
    assert_eq!(cache.stats(), CacheStats::default());
    cache.teardown();
    assert_eq!(cache.stats(), CacheStats::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_outliving_teardown_is_not_applied() {
    let transport = FakeTransport::new().with_delay(Duration::from_millis(100));
    transport.put_entity(trip(1, "Petra"));
    let cache = coordinator(transport);

    let (result, ()) = tokio::join!(cache.get_or_fetch(EntityKind::Trip, 1), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      cache.teardown();
    });

    assert!(result.is_ok());
    assert_eq!(cache.stats(), CacheStats::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_sorted_view_does_not_reorder_cache() {
    let transport = FakeTransport::new();
    let list_key = ListKey::new(EntityKind::Trip);
    transport.put_list(list_key.clone(), vec![trip(1, "Petra"), trip(2, "Aqaba")]);
    let cache = coordinator(transport);

    cache.fetch_list(&list_key).await.unwrap();
    let sorted = cache
      .sorted_list(&list_key, &SortSpec::ascending("name"))
      .unwrap();
    assert_eq!(sorted, vec![trip(2, "Aqaba"), trip(1, "Petra")]);

    let cached = cache.fetch_list(&list_key).await.unwrap();
    assert_eq!(cached.data, vec![trip(1, "Petra"), trip(2, "Aqaba")]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_caches_server_representation() {
    let transport = FakeTransport::new();
    let cache = coordinator(transport);

    let created = cache
      .create(EntityKind::Trip, json!({"name": "Ajloun"}))
      .await
      .unwrap();
    let key = created.key();

    let read = cache.get_or_fetch(key.kind, key.id.clone()).await.unwrap();
    assert_eq!(read.source, CacheSource::CacheFresh);
    assert_eq!(read.data, created);
    assert_eq!(cache.transport().entity_calls(), 0);
  }
}
