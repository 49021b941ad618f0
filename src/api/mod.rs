//! HTTP transport for the dashboard REST backend.

mod client;
pub mod types;

pub use client::HttpClient;
