//! Session-scoped entity cache for the dashboard backend.
//!
//! This module provides the coordinator every view reads through:
//! - Caches entities by (kind, id) with a per-kind freshness window
//! - Caches collection views and seeds detail lookups from them
//! - Collapses concurrent reads of one key into a single network call
//! - Applies writes to exactly the affected entry; lists opt in to updates
//! - Serves stale data when a refetch fails for network reasons

mod coordinator;
mod entity;
mod keys;
mod storage;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

pub use coordinator::{CacheStats, Coordinator};
pub use entity::{Entity, EntityData, SortSpec};
pub use keys::{CacheKey, EntityId, EntityKind, ListKey};
pub use storage::ListPolicy;
pub use traits::{CacheResult, CacheSource, Mutation, MutationOutcome, Transport};
