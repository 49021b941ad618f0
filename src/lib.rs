//! Data layer of the tourism ministry admin dashboard.
//!
//! - [`cache`]: session-scoped entity cache with list seeding, in-flight
//!   de-duplication and opt-in list updates
//! - [`ban`]: the ban countdown shown on user dialogs
//! - [`api`]: the HTTP transport for the dashboard REST backend

pub mod api;
pub mod ban;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;

pub use error::{FetchError, StatusError};
