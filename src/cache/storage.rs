//! In-memory cache state owned by the coordinator.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::entity::Entity;
use super::keys::{CacheKey, EntityId, EntityKind, ListKey};
use crate::error::FetchError;

/// A single cached entity.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
  pub value: Entity,
  /// Monotonic time of the last successful population
  pub fetched_at: Instant,
  /// Wall-clock time of the same, for reporting
  pub cached_at: DateTime<Utc>,
  pub stale_after: Duration,
  pub invalidated: bool,
  /// Written by our own mutation under a zero window; fresh until the next
  /// invalidation or refetch replaces it
  pub held: bool,
}

impl CacheEntry {
  pub fn new(value: Entity, stale_after: Duration) -> Self {
    Self {
      value,
      fetched_at: Instant::now(),
      cached_at: Utc::now(),
      stale_after,
      invalidated: false,
      held: false,
    }
  }

  /// The server's answer to a successful write. Kinds that always refetch
  /// still serve this copy until something invalidates it.
  pub fn written(value: Entity, stale_after: Duration) -> Self {
    Self {
      held: stale_after.is_zero(),
      ..Self::new(value, stale_after)
    }
  }

  /// Adopt a list item, inheriting the list's age.
  pub fn adopted(value: Entity, list: &ListCache) -> Self {
    Self {
      value,
      fetched_at: list.fetched_at,
      cached_at: list.cached_at,
      stale_after: list.stale_after,
      invalidated: false,
      held: false,
    }
  }

  /// A zero window means every access refetches, unless the entry holds
  /// our own write.
  pub fn is_stale(&self) -> bool {
    self.invalidated || (!self.held && self.fetched_at.elapsed() >= self.stale_after)
  }
}

/// A cached collection view, in server order.
#[derive(Debug, Clone)]
pub(crate) struct ListCache {
  pub items: Vec<Entity>,
  pub fetched_at: Instant,
  pub cached_at: DateTime<Utc>,
  pub stale_after: Duration,
  pub invalidated: bool,
}

impl ListCache {
  pub fn new(items: Vec<Entity>, stale_after: Duration) -> Self {
    Self {
      items,
      fetched_at: Instant::now(),
      cached_at: Utc::now(),
      stale_after,
      invalidated: false,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.invalidated || self.fetched_at.elapsed() >= self.stale_after
  }
}

/// How a subscribed list reacts to successful writes of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPolicy {
  /// Mark the list stale so the next read refetches it
  Invalidate,
  /// Remove deleted items in place; other writes invalidate
  Splice,
}

/// Effect of a successful write, as seen by list subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteEffect {
  Created,
  Changed,
  Deleted,
}

pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

/// A registered in-flight fetch. Its result is applied only while its
/// ticket is still the registered one.
pub(crate) struct Flight<V> {
  pub ticket: u64,
  pub future: SharedFetch<V>,
}

/// Everything the coordinator tracks for one session.
#[derive(Default)]
pub(crate) struct CacheState {
  pub entries: HashMap<CacheKey, CacheEntry>,
  pub lists: HashMap<ListKey, ListCache>,
  pub subscriptions: HashMap<ListKey, ListPolicy>,
  /// Keys deleted by a confirmed mutation; never adopted from lists
  pub tombstones: HashSet<CacheKey>,
  pub entity_flights: HashMap<CacheKey, Flight<Entity>>,
  pub list_flights: HashMap<ListKey, Flight<Vec<Entity>>>,
  next_ticket: u64,
}

impl CacheState {
  pub fn issue_ticket(&mut self) -> u64 {
    self.next_ticket += 1;
    self.next_ticket
  }

  /// Whether `ticket` is still the registered fetch for `key`.
  pub fn entity_flight_is_current(&self, key: &CacheKey, ticket: u64) -> bool {
    self.entity_flights.get(key).map(|f| f.ticket) == Some(ticket)
  }

  pub fn list_flight_is_current(&self, key: &ListKey, ticket: u64) -> bool {
    self.list_flights.get(key).map(|f| f.ticket) == Some(ticket)
  }

  /// Find a fresh list item of the right kind that already carries the
  /// detail payload for `key`, and store it as the entry.
  pub fn adopt_from_lists(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    if self.tombstones.contains(key) {
      return None;
    }

    let entry = self
      .lists
      .iter()
      .filter(|(list_key, list)| list_key.kind == key.kind && !list.is_stale())
      .find_map(|(_, list)| {
        list
          .items
          .iter()
          .find(|item| item.is_detail() && item.id() == &key.id)
          .map(|item| CacheEntry::adopted(item.clone(), list))
      })?;

    self.entries.insert(key.clone(), entry.clone());
    Some(entry)
  }

  /// Apply a successful write to subscribed lists of `kind`.
  ///
  /// Returns the keys of lists that were invalidated or spliced.
  pub fn touch_subscribed_lists(
    &mut self,
    kind: EntityKind,
    id: &EntityId,
    effect: WriteEffect,
  ) -> Vec<ListKey> {
    let mut touched = Vec::new();

    for (list_key, policy) in &self.subscriptions {
      if list_key.kind != kind {
        continue;
      }
      let Some(list) = self.lists.get_mut(list_key) else {
        continue;
      };

      match (policy, effect) {
        (ListPolicy::Splice, WriteEffect::Deleted) => {
          let before = list.items.len();
          list.items.retain(|item| item.id() != id);
          if list.items.len() != before {
            touched.push(list_key.clone());
          }
        }
        _ => {
          list.invalidated = true;
          touched.push(list_key.clone());
        }
      }
    }

    touched
  }

  pub fn invalidate_kind(&mut self, kind: EntityKind) -> Vec<ListKey> {
    for (key, entry) in self.entries.iter_mut() {
      if key.kind == kind {
        entry.invalidated = true;
      }
    }

    let mut invalidated = Vec::new();
    for (key, list) in self.lists.iter_mut() {
      if key.kind == kind {
        list.invalidated = true;
        invalidated.push(key.clone());
      }
    }
    invalidated
  }

  /// Drop everything, including in-flight registrations.
  pub fn clear(&mut self) {
    self.entries.clear();
    self.lists.clear();
    self.subscriptions.clear();
    self.tombstones.clear();
    self.entity_flights.clear();
    self.list_flights.clear();
  }

  pub fn in_flight(&self) -> usize {
    self.entity_flights.len() + self.list_flights.len()
  }
}

/// Lock the state, recovering from a poisoned mutex.
pub(crate) fn lock_state<'a>(
  state: &'a Mutex<CacheState>,
  op: &'static str,
) -> MutexGuard<'a, CacheState> {
  match state.lock() {
    Ok(guard) => guard,
    Err(poisoned) => {
      warn!(
        op,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock"
      );
      poisoned.into_inner()
    }
  }
}
