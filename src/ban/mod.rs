//! Ban countdown shown on user dialogs.
//!
//! The pure transition rules live in [`TimedStatusMachine`]; [`BanCountdown`]
//! owns the one-second ticking task and publishes every status change on a
//! watch channel.

mod countdown;
mod machine;
mod remaining;

pub use countdown::BanCountdown;
pub use machine::{TimedStatus, TimedStatusMachine, Transition};
pub use remaining::Remaining;
