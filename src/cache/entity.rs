//! Cached entity payloads.

use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

use super::keys::{CacheKey, EntityId, EntityKind};

/// Server payload of one entity, opaque to the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityData {
  pub kind: EntityKind,
  pub id: EntityId,
  pub fields: Value,
}

/// An entity as returned by the backend.
///
/// The variant is decided once, where the response is decoded: detail
/// endpoints always yield `Detail`, list endpoints yield `Detail` only for
/// items that already carry the kind's detail-only field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "fidelity", rename_all = "lowercase")]
pub enum Entity {
  Summary(EntityData),
  Detail(EntityData),
}

impl Entity {
  pub fn summary(kind: EntityKind, id: impl Into<EntityId>, fields: Value) -> Self {
    Self::Summary(EntityData {
      kind,
      id: id.into(),
      fields,
    })
  }

  pub fn detail(kind: EntityKind, id: impl Into<EntityId>, fields: Value) -> Self {
    Self::Detail(EntityData {
      kind,
      id: id.into(),
      fields,
    })
  }

  pub fn data(&self) -> &EntityData {
    match self {
      Self::Summary(data) | Self::Detail(data) => data,
    }
  }

  pub fn kind(&self) -> EntityKind {
    self.data().kind
  }

  pub fn id(&self) -> &EntityId {
    &self.data().id
  }

  pub fn key(&self) -> CacheKey {
    CacheKey::new(self.kind(), self.id().clone())
  }

  pub fn is_detail(&self) -> bool {
    matches!(self, Self::Detail(_))
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.data().fields.get(name)
  }
}

/// Client-side ordering applied to a list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
  pub field: String,
  pub descending: bool,
}

impl SortSpec {
  pub fn ascending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: false,
    }
  }

  pub fn descending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: true,
    }
  }

  /// Sort in place. Stable, so ties keep server order; missing values sink
  /// to the end regardless of direction.
  pub fn apply(&self, items: &mut [Entity]) {
    items.sort_by(|a, b| {
      match (a.field(&self.field), b.field(&self.field)) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(x), Some(y)) => {
          let ord = compare_values(x, y);
          if self.descending {
            ord.reverse()
          } else {
            ord
          }
        }
      }
    });
  }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    _ => a.to_string().cmp(&b.to_string()),
  }
}
