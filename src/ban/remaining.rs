use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Time left on a ban, as the backend reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Remaining {
  pub days: i64,
  pub hours: i64,
  pub minutes: i64,
  pub seconds: i64,
}

impl Remaining {
  pub const fn new(days: i64, hours: i64, minutes: i64, seconds: i64) -> Self {
    Self {
      days,
      hours,
      minutes,
      seconds,
    }
  }

  /// Split a number of seconds into days/hours/minutes/seconds.
  /// Negative input clamps to zero.
  pub fn from_secs(total: i64) -> Self {
    let total = total.max(0);
    Self {
      days: total / DAY,
      hours: total % DAY / HOUR,
      minutes: total % HOUR / MINUTE,
      seconds: total % MINUTE,
    }
  }

  /// Time left until `ends_at`, as seen at `now`.
  pub fn until(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
    Self::from_secs((ends_at - now).num_seconds())
  }

  /// Nothing left on any field.
  pub fn is_elapsed(&self) -> bool {
    self.days <= 0 && self.hours <= 0 && self.minutes <= 0 && self.seconds <= 0
  }

  /// Take one second off, borrowing from the larger units.
  ///
  /// Returns `true` once the countdown has run out, either by reaching zero
  /// or by borrowing past zero days.
  pub fn tick(&mut self) -> bool {
    self.seconds -= 1;
    if self.seconds < 0 {
      self.seconds = 59;
      self.minutes -= 1;
      if self.minutes < 0 {
        self.minutes = 59;
        self.hours -= 1;
        if self.hours < 0 {
          self.hours = 23;
          self.days -= 1;
          if self.days < 0 {
            *self = Self::default();
            return true;
          }
        }
      }
    }
    self.is_elapsed()
  }
}

impl fmt::Display for Remaining {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.days > 0 {
      write!(f, "{}d ", self.days)?;
    }
    write!(
      f,
      "{:02}:{:02}:{:02}",
      self.hours.max(0),
      self.minutes.max(0),
      self.seconds.max(0)
    )
  }
}
