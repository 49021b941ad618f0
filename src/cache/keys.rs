//! Cache key definitions.
//!
//! `CacheKey` identifies one entity, `ListKey` identifies one collection view.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FetchError;

/// Domain object types managed by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Company,
  Event,
  Place,
  User,
  Trip,
  Post,
  Blog,
  Notification,
  Support,
}

impl EntityKind {
  pub const ALL: [EntityKind; 9] = [
    EntityKind::Company,
    EntityKind::Event,
    EntityKind::Place,
    EntityKind::User,
    EntityKind::Trip,
    EntityKind::Post,
    EntityKind::Blog,
    EntityKind::Notification,
    EntityKind::Support,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Company => "company",
      Self::Event => "event",
      Self::Place => "place",
      Self::User => "user",
      Self::Trip => "trip",
      Self::Post => "post",
      Self::Blog => "blog",
      Self::Notification => "notification",
      Self::Support => "support",
    }
  }

  /// REST path segment for this kind's collection.
  pub fn path_segment(&self) -> &'static str {
    match self {
      Self::Company => "companies",
      Self::Event => "events",
      Self::Place => "places",
      Self::User => "users",
      Self::Trip => "trips",
      Self::Post => "posts",
      Self::Blog => "blogs",
      Self::Notification => "notifications",
      Self::Support => "support",
    }
  }

  /// Field that only the detail endpoint returns.
  ///
  /// A list item carrying it is complete enough to serve detail lookups.
  pub fn detail_marker(&self) -> &'static str {
    match self {
      Self::Company | Self::Event | Self::Place | Self::Trip => "description",
      Self::User => "profile",
      Self::Post | Self::Blog => "content",
      Self::Notification => "body",
      Self::Support => "answer",
    }
  }

  /// Default freshness window for cached entries of this kind.
  pub fn default_stale_after(&self) -> Duration {
    match self {
      // Ban state and unread counts change under our feet
      Self::User | Self::Notification => Duration::ZERO,
      Self::Post => Duration::from_secs(60),
      Self::Trip | Self::Event | Self::Blog => Duration::from_secs(5 * 60),
      Self::Place | Self::Company | Self::Support => Duration::from_secs(10 * 60),
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = FetchError;

  /// Accepts the singular name or the REST segment, case-insensitively.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let needle = s.trim().to_lowercase();
    if needle.is_empty() {
      return Err(FetchError::InvalidKey("entity kind is empty".to_string()));
    }
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str() == needle || kind.path_segment() == needle)
      .ok_or_else(|| FetchError::InvalidKey(format!("unknown entity kind '{}'", s)))
  }
}

/// Server-side identifier of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
  Int(i64),
  Str(String),
}

impl EntityId {
  /// Parse a user-supplied id. Numeric strings normalize to `Int` so that
  /// `"7"` and `7` share a cache slot.
  pub fn parse(raw: &str) -> Result<Self, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(FetchError::InvalidKey("entity id is empty".to_string()));
    }
    Ok(match raw.parse::<i64>() {
      Ok(n) => Self::Int(n),
      Err(_) => Self::Str(raw.to_string()),
    })
  }
}

impl From<i64> for EntityId {
  fn from(id: i64) -> Self {
    Self::Int(id)
  }
}

impl From<i32> for EntityId {
  fn from(id: i32) -> Self {
    Self::Int(i64::from(id))
  }
}

impl From<u64> for EntityId {
  fn from(id: u64) -> Self {
    match i64::try_from(id) {
      Ok(n) => Self::Int(n),
      Err(_) => Self::Str(id.to_string()),
    }
  }
}

/// Same rules as [`EntityId::parse`], so string ids share slots with
/// numeric ones.
impl TryFrom<&str> for EntityId {
  type Error = FetchError;

  fn try_from(id: &str) -> Result<Self, Self::Error> {
    Self::parse(id)
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(n) => write!(f, "{}", n),
      Self::Str(s) => f.write_str(s),
    }
  }
}

/// Identifies one cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub kind: EntityKind,
  pub id: EntityId,
}

impl CacheKey {
  pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
    Self {
      kind,
      id: id.into(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

/// Identifies one collection view: a kind plus its filter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListKey {
  pub kind: EntityKind,
  pub filters: BTreeMap<String, String>,
}

impl ListKey {
  pub fn new(kind: EntityKind) -> Self {
    Self {
      kind,
      filters: BTreeMap::new(),
    }
  }

  pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.filters.insert(name.into(), value.into());
    self
  }

  /// Filter pairs in a stable order, ready for a query string.
  pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
    self.filters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    if self.filters.is_empty() {
      format!("all {}", self.kind.path_segment())
    } else {
      let filters: Vec<String> = self
        .filters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
      format!("{} where {}", self.kind.path_segment(), filters.join(", "))
    }
  }
}

impl fmt::Display for ListKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}
