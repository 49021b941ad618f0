//! Transition rules for the ban countdown, free of timers and I/O.

use super::remaining::Remaining;
use crate::error::StatusError;

/// What a dialog shows about a user's ban
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TimedStatus {
  /// Nothing started yet
  #[default]
  Unknown,
  /// Waiting for the authoritative remaining time
  Loading,
  /// Ban has no end date
  Permanent,
  /// Ban ends after the given time
  Countdown(Remaining),
  /// Ban is over. Terminal.
  Expired,
  /// Fetch failed. Terminal until the countdown is started again.
  Error(String),
}

impl TimedStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TimedStatus::Expired | TimedStatus::Error(_))
  }

  pub fn remaining(&self) -> Option<&Remaining> {
    match self {
      TimedStatus::Countdown(r) => Some(r),
      _ => None,
    }
  }
}

/// Outcome of feeding one input to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Unchanged,
  Changed,
  /// Entered `Expired` for the first time; the expiry callback must run
  Expired,
}

/// Ban status transitions with a once-only expiry notification.
#[derive(Debug, Default)]
pub struct TimedStatusMachine {
  status: TimedStatus,
  notified: bool,
}

impl TimedStatusMachine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(&self) -> &TimedStatus {
    &self.status
  }

  pub fn begin_loading(&mut self) -> Transition {
    match self.status {
      TimedStatus::Unknown => {
        self.status = TimedStatus::Loading;
        Transition::Changed
      }
      _ => Transition::Unchanged,
    }
  }

  /// Apply the server's answer: `None` means no end date.
  ///
  /// After expiry the machine never goes back to counting down; a positive
  /// answer at that point is reported as [`StatusError::StateConflict`].
  pub fn resolve(&mut self, remaining: Option<Remaining>) -> Result<Transition, StatusError> {
    if self.status.is_terminal() {
      return match remaining {
        Some(r) if self.status == TimedStatus::Expired && !r.is_elapsed() => {
          Err(StatusError::StateConflict { remaining: r })
        }
        _ => Ok(Transition::Unchanged),
      };
    }

    Ok(match remaining {
      None => self.set(TimedStatus::Permanent),
      Some(r) if r.is_elapsed() => self.expire(),
      Some(r) => self.set(TimedStatus::Countdown(r)),
    })
  }

  pub fn fail(&mut self, message: impl Into<String>) -> Transition {
    if self.status.is_terminal() {
      return Transition::Unchanged;
    }
    self.set(TimedStatus::Error(message.into()))
  }

  /// One second passed. Only a running countdown reacts.
  pub fn tick(&mut self) -> Transition {
    let TimedStatus::Countdown(remaining) = &mut self.status else {
      return Transition::Unchanged;
    };
    if remaining.tick() {
      self.expire()
    } else {
      Transition::Changed
    }
  }

  fn set(&mut self, status: TimedStatus) -> Transition {
    if self.status == status {
      return Transition::Unchanged;
    }
    self.status = status;
    Transition::Changed
  }

  fn expire(&mut self) -> Transition {
    self.status = TimedStatus::Expired;
    if self.notified {
      return Transition::Changed;
    }
    self.notified = true;
    Transition::Expired
  }
}
