//! Control API
//!
//! Exposes the controlled selector over HTTP so an operator can inspect, rotate and pin
//! the active forwarder at runtime.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
