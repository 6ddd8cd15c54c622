//! Proxy server implementation
//!
//! This module provides the proxy data path:
//! - HTTP and CONNECT request handling
//! - Listener groups, each with its own forwarders, strategy and allow-list
//! - Forwarder selection strategies, including the externally controlled one
//! - Dialing through direct, HTTP CONNECT and SOCKS5 egress
//! - Duplex relay with deadline-based unblocking
//! - Health feedback and periodic health checking

pub mod dispatcher;
pub mod group;
pub mod handler;
pub mod health;
pub mod message;
pub mod middleware;
pub mod relay;
pub mod rotation;
pub mod server;
pub mod transport;

pub use dispatcher::{DispatchError, Dispatched, Dispatcher};
pub use group::ListenerGroup;
pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use health::{FailureRecorder, HealthChecker, HealthRecorder};
pub use relay::{DuplexRelay, RelayError, RelayOutcome};
pub use rotation::{create_selector, ControlledSelector, ProxySelector, RotationStrategy};
pub use server::ProxyServer;
pub use transport::ProxyTransport;
