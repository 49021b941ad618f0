//! Serde-deserializable types matching dashboard API responses.
//!
//! The summary/detail decision for every entity is made here, once, so the
//! cache never has to guess from field presence.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::ban::Remaining;
use crate::cache::{Entity, EntityId, EntityKind};
use crate::error::FetchError;

/// Strip the `{"data": ...}` envelope some endpoints wrap their payload in.
///
/// An object that has its own `id` is an entity, even if it has a `data`
/// field.
pub fn unwrap_envelope(body: Value) -> Value {
  match body {
    Value::Object(mut map) if map.contains_key("data") && !map.contains_key("id") => {
      map.remove("data").unwrap_or(Value::Null)
    }
    other => other,
  }
}

/// Read an entity id from a payload, accepting `id` or `_id`.
fn extract_id(kind: EntityKind, fields: &Value) -> Result<EntityId, FetchError> {
  let raw = fields
    .get("id")
    .or_else(|| fields.get("_id"))
    .ok_or_else(|| FetchError::Decode(format!("{} payload has no id", kind)))?;

  match raw {
    Value::Number(n) => n
      .as_i64()
      .map(EntityId::Int)
      .ok_or_else(|| FetchError::Decode(format!("{} id {} is not an integer", kind, n))),
    Value::String(s) => EntityId::parse(s)
      .map_err(|_| FetchError::Decode(format!("{} payload has an empty id", kind))),
    other => Err(FetchError::Decode(format!(
      "{} id has unexpected type: {}",
      kind, other
    ))),
  }
}

/// Decode a detail endpoint response.
pub fn detail_entity(kind: EntityKind, body: Value) -> Result<Entity, FetchError> {
  let fields = unwrap_envelope(body);
  if !fields.is_object() {
    return Err(FetchError::Decode(format!("{} payload is not an object", kind)));
  }
  let id = extract_id(kind, &fields)?;
  Ok(Entity::detail(kind, id, fields))
}

/// Decode one item of a list response, classifying it by the kind's
/// detail-only field.
pub fn list_item(kind: EntityKind, fields: Value) -> Result<Entity, FetchError> {
  if !fields.is_object() {
    return Err(FetchError::Decode(format!("{} list item is not an object", kind)));
  }
  let id = extract_id(kind, &fields)?;
  let has_detail = fields
    .get(kind.detail_marker())
    .is_some_and(|value| !value.is_null());

  Ok(if has_detail {
    Entity::detail(kind, id, fields)
  } else {
    Entity::summary(kind, id, fields)
  })
}

/// Decode a list endpoint response.
///
/// Accepts a bare array, `{"data": [...]}`, or a paginated
/// `{"data": {"items": [...]}}` / `{"items": [...]}` shape.
pub fn list_entities(kind: EntityKind, body: Value) -> Result<Vec<Entity>, FetchError> {
  let items = match unwrap_envelope(body) {
    Value::Array(items) => items,
    Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("results")) {
      Some(Value::Array(items)) => items,
      _ => {
        return Err(FetchError::Decode(format!(
          "{} list response has no item array",
          kind
        )))
      }
    },
    Value::Null => Vec::new(),
    other => {
      return Err(FetchError::Decode(format!(
        "{} list response has unexpected type: {}",
        kind, other
      )))
    }
  };

  items.into_iter().map(|item| list_item(kind, item)).collect()
}

// ============================================================================
// Ban status endpoint response
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ApiBanStatus {
  pub days: Option<i64>,
  pub hours: Option<i64>,
  pub minutes: Option<i64>,
  pub seconds: Option<i64>,
  #[serde(alias = "endsAt", alias = "banned_until")]
  pub ends_at: Option<DateTime<Utc>>,
}

impl ApiBanStatus {
  /// `None` means the ban has no end date.
  pub fn into_remaining(self, now: DateTime<Utc>) -> Option<Remaining> {
    if let Some(ends_at) = self.ends_at {
      return Some(Remaining::until(ends_at, now));
    }
    if self.days.is_none() && self.hours.is_none() && self.minutes.is_none() && self.seconds.is_none()
    {
      return None;
    }
    Some(Remaining::new(
      self.days.unwrap_or(0),
      self.hours.unwrap_or(0),
      self.minutes.unwrap_or(0),
      self.seconds.unwrap_or(0),
    ))
  }
}

/// Decode the ban endpoint body into the remaining time.
pub fn ban_remaining(body: Option<Value>, now: DateTime<Utc>) -> Result<Option<Remaining>, FetchError> {
  let Some(body) = body.map(unwrap_envelope) else {
    return Ok(None);
  };
  if body.is_null() {
    return Ok(None);
  }
  let status: ApiBanStatus =
    serde_json::from_value(body).map_err(|e| FetchError::Decode(e.to_string()))?;
  Ok(status.into_remaining(now))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  #[test]
  fn test_detail_unwraps_envelope() {
    let entity = detail_entity(
      EntityKind::Event,
      json!({"data": {"id": "9", "title": "Jerash Festival"}}),
    )
    .unwrap();
    assert!(entity.is_detail());
    assert_eq!(entity.id(), &EntityId::Int(9));
    assert_eq!(entity.field("title"), Some(&json!("Jerash Festival")));
  }

  #[test]
  fn test_entity_with_own_data_field_is_not_unwrapped() {
    let entity = detail_entity(EntityKind::Blog, json!({"id": 3, "data": "raw"})).unwrap();
    assert_eq!(entity.id(), &EntityId::Int(3));
  }

  #[test]
  fn test_list_items_classified_by_marker() {
    let items = list_entities(
      EntityKind::Trip,
      json!({"data": [
        {"id": 1, "name": "Wadi Rum"},
        {"id": 2, "name": "Dead Sea", "description": "Floating"},
        {"id": 3, "name": "Ajloun", "description": null}
      ]}),
    )
    .unwrap();
    let detail: Vec<bool> = items.iter().map(Entity::is_detail).collect();
    assert_eq!(detail, vec![false, true, false]);
  }

  #[test]
  fn test_paginated_list_shape() {
    let items = list_entities(
      EntityKind::User,
      json!({"data": {"items": [{"_id": "u-1", "name": "Lina"}], "total": 1}}),
    )
    .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id(), &EntityId::Str("u-1".to_string()));
  }

  #[test]
  fn test_missing_id_is_decode_error() {
    assert!(matches!(
      detail_entity(EntityKind::Place, json!({"name": "Petra"})),
      Err(FetchError::Decode(_))
    ));
  }

  #[test]
  fn test_ban_remaining_shapes() {
    let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

    assert_eq!(ban_remaining(None, now), Ok(None));
    assert_eq!(ban_remaining(Some(json!({"data": null})), now), Ok(None));
    assert_eq!(
      ban_remaining(
        Some(json!({"days": null, "hours": null, "minutes": null, "seconds": null})),
        now
      ),
      Ok(None)
    );
    assert_eq!(
      ban_remaining(Some(json!({"days": 1, "hours": 2, "minutes": null, "seconds": 5})), now),
      Ok(Some(Remaining::new(1, 2, 0, 5)))
    );
    assert_eq!(
      ban_remaining(Some(json!({"ends_at": "2026-05-01T01:00:30Z"})), now),
      Ok(Some(Remaining::new(0, 1, 0, 30)))
    );
  }
}
