//! Relay Gate - forward proxy with pluggable upstream selection
//!
//! ## Features
//!
//! - HTTP and CONNECT proxy front-end with IP allow-list, pretend mode and Basic auth
//! - Upstream forwarders reached directly, through HTTP CONNECT or through SOCKS5
//! - Selection strategies: round-robin, high-availability, latency-based,
//!   destination-hash and an operator-controlled strategy
//! - Failure feedback and periodic health checking of forwarders
//! - Control API to inspect, rotate and pin the active forwarder

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{GateError, Result};
