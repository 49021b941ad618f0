//! Scripted in-memory transport for coordinator tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::entity::Entity;
use super::keys::{CacheKey, EntityKind, ListKey};
use super::traits::{Mutation, MutationOutcome, Transport};
use crate::error::FetchError;

#[derive(Default)]
pub(crate) struct FakeTransport {
  entities: Mutex<HashMap<CacheKey, Result<Entity, FetchError>>>,
  lists: Mutex<HashMap<ListKey, Vec<Entity>>>,
  mutations: Mutex<HashMap<CacheKey, Result<MutationOutcome, FetchError>>>,
  transient_failures: AtomicUsize,
  entity_calls: AtomicUsize,
  list_calls: AtomicUsize,
  mutation_calls: AtomicUsize,
  next_id: AtomicI64,
  delay: Duration,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      next_id: AtomicI64::new(1000),
      ..Self::default()
    }
  }

  /// Every call sleeps this long before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn put_entity(&self, entity: Entity) {
    self
      .entities
      .lock()
      .unwrap()
      .insert(entity.key(), Ok(entity));
  }

  pub fn put_entity_error(&self, key: CacheKey, err: FetchError) {
    self.entities.lock().unwrap().insert(key, Err(err));
  }

  pub fn put_list(&self, key: ListKey, items: Vec<Entity>) {
    self.lists.lock().unwrap().insert(key, items);
  }

  pub fn put_mutation(&self, key: CacheKey, outcome: Result<MutationOutcome, FetchError>) {
    self.mutations.lock().unwrap().insert(key, outcome);
  }

  /// The next `n` reads fail with a network error before consulting the script.
  pub fn fail_next_fetches(&self, n: usize) {
    self.transient_failures.store(n, Ordering::SeqCst);
  }

  pub fn entity_calls(&self) -> usize {
    self.entity_calls.load(Ordering::SeqCst)
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn mutation_calls(&self) -> usize {
    self.mutation_calls.load(Ordering::SeqCst)
  }

  async fn pause(&self) {
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
  }

  fn take_transient_failure(&self) -> Option<FetchError> {
    self
      .transient_failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .ok()
      .map(|_| FetchError::Network("connection refused".to_string()))
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn fetch_entity(&self, key: &CacheKey) -> Result<Entity, FetchError> {
    self.entity_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    if let Some(err) = self.take_transient_failure() {
      return Err(err);
    }
    self
      .entities
      .lock()
      .unwrap()
      .get(key)
      .cloned()
      .unwrap_or_else(|| Err(FetchError::not_found(key)))
  }

  async fn fetch_list(&self, key: &ListKey) -> Result<Vec<Entity>, FetchError> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    if let Some(err) = self.take_transient_failure() {
      return Err(err);
    }
    Ok(self.lists.lock().unwrap().get(key).cloned().unwrap_or_default())
  }

  async fn create(&self, kind: EntityKind, body: &Value) -> Result<Entity, FetchError> {
    self.mutation_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let mut fields = body.clone();
    if let Some(map) = fields.as_object_mut() {
      map.insert("id".to_string(), json!(id));
    }
    Ok(Entity::detail(kind, id, fields))
  }

  async fn send_mutation(
    &self,
    key: &CacheKey,
    _mutation: &Mutation,
  ) -> Result<MutationOutcome, FetchError> {
    self.mutation_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    self
      .mutations
      .lock()
      .unwrap()
      .get(key)
      .cloned()
      .unwrap_or(Ok(MutationOutcome::Accepted))
  }
}
