//! Ticking task that drives a [`TimedStatusMachine`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::machine::{TimedStatus, TimedStatusMachine, Transition};
use super::remaining::Remaining;
use crate::cache::EntityId;
use crate::error::FetchError;

/// Live ban countdown for one user, owned by whatever shows it.
///
/// `start` fetches the authoritative remaining time once, then counts down
/// locally every second. `stop` (or dropping the countdown) cancels the
/// task; nothing it does afterwards reaches shared state.
pub struct BanCountdown {
  status: Arc<watch::Sender<TimedStatus>>,
  task: Option<JoinHandle<()>>,
  alive: Arc<AtomicBool>,
  period: Duration,
}

impl BanCountdown {
  pub fn new() -> Self {
    Self::with_period(Duration::from_secs(1))
  }

  /// Countdown ticking at a custom period. Each tick still removes one
  /// second from the remaining time.
  pub fn with_period(period: Duration) -> Self {
    let (tx, _rx) = watch::channel(TimedStatus::Unknown);
    Self {
      status: Arc::new(tx),
      task: None,
      alive: Arc::new(AtomicBool::new(false)),
      period,
    }
  }

  /// Current status snapshot.
  pub fn status(&self) -> TimedStatus {
    self.status.borrow().clone()
  }

  /// Watch status changes.
  pub fn subscribe(&self) -> watch::Receiver<TimedStatus> {
    self.status.subscribe()
  }

  pub fn is_running(&self) -> bool {
    self.task.as_ref().is_some_and(|task| !task.is_finished())
  }

  /// Begin tracking `subject`, replacing any countdown already running.
  ///
  /// `on_expired` runs at most once, when the ban runs out (or immediately
  /// if the server says it already has).
  pub fn start<F, Fut, E>(&mut self, subject: EntityId, fetch_remaining: F, on_expired: E)
  where
    F: FnOnce(EntityId) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Remaining>, FetchError>> + Send + 'static,
    E: FnOnce(EntityId) + Send + 'static,
  {
    self.stop();

    let alive = Arc::new(AtomicBool::new(true));
    self.alive = Arc::clone(&alive);
    self.status.send_replace(TimedStatus::Loading);

    let run = CountdownRun {
      subject,
      status: Arc::clone(&self.status),
      alive,
      on_expired: Some(on_expired),
      period: self.period,
    };
    self.task = Some(tokio::spawn(run.drive(fetch_remaining)));
  }

  /// Cancel the ticking task. The last published status stays visible.
  pub fn stop(&mut self) {
    self.alive.store(false, Ordering::SeqCst);
    if let Some(task) = self.task.take() {
      task.abort();
      debug!("ban countdown stopped");
    }
  }
}

impl Default for BanCountdown {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for BanCountdown {
  fn drop(&mut self) {
    self.stop();
  }
}

struct CountdownRun<E> {
  subject: EntityId,
  status: Arc<watch::Sender<TimedStatus>>,
  alive: Arc<AtomicBool>,
  on_expired: Option<E>,
  period: Duration,
}

impl<E: FnOnce(EntityId)> CountdownRun<E> {
  async fn drive<F, Fut>(mut self, fetch_remaining: F)
  where
    F: FnOnce(EntityId) -> Fut,
    Fut: Future<Output = Result<Option<Remaining>, FetchError>>,
  {
    let mut machine = TimedStatusMachine::new();
    machine.begin_loading();

    let answer = fetch_remaining(self.subject.clone()).await;
    if !self.is_alive() {
      return;
    }

    let transition = match answer {
      Ok(remaining) => {
        info!(subject = %self.subject, ?remaining, "ban status loaded");
        match machine.resolve(remaining) {
          Ok(transition) => transition,
          Err(conflict) => {
            debug!(subject = %self.subject, %conflict, "ignoring stale ban status");
            Transition::Unchanged
          }
        }
      }
      Err(err) => {
        warn!(subject = %self.subject, error = %err, "failed to load ban status");
        machine.fail(err.to_string())
      }
    };
    self.publish(&machine, transition);

    if !matches!(machine.status(), TimedStatus::Countdown(_)) {
      return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
    // A stalled runtime catches up instead of drifting behind the server
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
      ticker.tick().await;
      if !self.is_alive() {
        return;
      }
      let transition = machine.tick();
      self.publish(&machine, transition);
      if machine.status().is_terminal() {
        return;
      }
    }
  }

  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  fn publish(&mut self, machine: &TimedStatusMachine, transition: Transition) {
    // `stop` may land on another worker after the caller's liveness check
    if transition == Transition::Unchanged || !self.is_alive() {
      return;
    }
    self.status.send_replace(machine.status().clone());

    if transition == Transition::Expired && self.is_alive() {
      if let Some(on_expired) = self.on_expired.take() {
        info!(subject = %self.subject, "ban expired");
        on_expired(self.subject.clone());
      }
    }
  }
}
