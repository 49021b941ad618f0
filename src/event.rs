use tokio::sync::broadcast;

use crate::cache::{CacheKey, ListKey};

/// Notifications emitted by the coordinator so dependent views can refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// An entity entry was written (fetch, adoption or mutation)
  EntityStored(CacheKey),
  /// An entity entry was dropped (confirmed delete or not found)
  EntityRemoved(CacheKey),
  /// A list view was refetched
  ListStored(ListKey),
  /// A list view was invalidated or spliced by a write
  ListInvalidated(ListKey),
  /// The backend rejected our credentials; the cache has been torn down
  SessionExpired,
  /// The cache was torn down
  Cleared,
}

/// Fan-out of cache events to any number of listeners
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Publish an event. Nobody listening is fine.
  pub fn emit(&self, event: CacheEvent) {
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
