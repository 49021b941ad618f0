//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::entity::Entity;
use super::keys::{CacheKey, EntityKind, ListKey};
use crate::error::FetchError;

/// Outbound contract to the backend.
///
/// The coordinator treats every call as an opaque async operation with a
/// typed outcome; retries and caching are layered on top.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Fetch the full representation of one entity.
  async fn fetch_entity(&self, key: &CacheKey) -> Result<Entity, FetchError>;

  /// Fetch a collection view in server order.
  async fn fetch_list(&self, key: &ListKey) -> Result<Vec<Entity>, FetchError>;

  /// Create a new entity; the server assigns its id.
  async fn create(&self, kind: EntityKind, body: &Value) -> Result<Entity, FetchError>;

  /// Apply a write to an existing entity.
  async fn send_mutation(
    &self,
    key: &CacheKey,
    mutation: &Mutation,
  ) -> Result<MutationOutcome, FetchError>;
}

/// A write against an existing entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Partial update with a JSON patch body
  Update(Value),
  /// Remove the entity
  Delete,
  /// Named action endpoint, e.g. `ban` or `unban` on a user
  Action { name: String, body: Value },
}

impl Mutation {
  pub fn action(name: impl Into<String>, body: Value) -> Self {
    Self::Action {
      name: name.into(),
      body,
    }
  }

  pub fn label(&self) -> &str {
    match self {
      Self::Update(_) => "update",
      Self::Delete => "delete",
      Self::Action { name, .. } => name,
    }
  }
}

/// What the server reported after a successful write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// Server returned the new representation
  Saved(Entity),
  /// Server confirmed the deletion
  Deleted,
  /// Server accepted the write without returning a body
  Accepted,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a fresh cache entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result adopted from a cached list.
  pub fn from_list(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::ListSeed,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Detail entry adopted from a list view that already carried it
  ListSeed,
  /// Refetch failed, serving the stale entry
  Offline,
}
