//! Typed errors surfaced by the cache coordinator and the ban countdown.

use thiserror::Error;

use crate::ban::Remaining;
use crate::cache::{CacheKey, EntityId, EntityKind};

/// Failure of a read or write against the backend.
///
/// `Clone` because a single in-flight fetch hands its outcome to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Transport or server failure. Safe to retry.
  #[error("network error: {0}")]
  Network(String),
  /// 401/403 from the backend. Ends the session.
  #[error("not authorized (HTTP {status})")]
  Auth { status: u16 },
  /// The requested entity (or, without an id, collection) does not exist
  /// server-side.
  #[error("{} not found", target(.kind, .id.as_ref()))]
  NotFound {
    kind: EntityKind,
    id: Option<EntityId>,
  },
  /// Kind or id could not be turned into a cache key.
  #[error("invalid cache key: {0}")]
  InvalidKey(String),
  /// The backend answered with a body we could not make sense of.
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl FetchError {
  pub fn not_found(key: &CacheKey) -> Self {
    FetchError::NotFound {
      kind: key.kind,
      id: Some(key.id.clone()),
    }
  }

  /// Only transport failures are worth retrying automatically.
  pub fn is_retryable(&self) -> bool {
    matches!(self, FetchError::Network(_))
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, FetchError::Auth { .. })
  }
}

fn target(kind: &EntityKind, id: Option<&EntityId>) -> String {
  match id {
    Some(id) => format!("{}:{}", kind, id),
    None => kind.path_segment().to_string(),
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      FetchError::Decode(err.to_string())
    } else {
      FetchError::Network(err.to_string())
    }
  }
}

/// Errors raised by the timed status state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
  /// The server still reports time left but the countdown already expired
  /// locally. Expired stays terminal; this is logged, never shown.
  #[error("server reported {remaining} remaining after local expiry")]
  StateConflict { remaining: Remaining },
}
