//! Dispatch: pick a forwarder and dial the target through it

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::GateError;
use crate::models::Forwarder;
use crate::proxy::health::HealthRecorder;
use crate::proxy::relay::{RelayError, Side};
use crate::proxy::rotation::ProxySelector;
use crate::proxy::transport::{parse_authority, ProxyTransport};

/// Default bound on establishing an upstream connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live upstream connection and the forwarder it went through
#[derive(Debug)]
pub struct Dispatched {
    pub connection: TcpStream,
    pub forwarder: Arc<Forwarder>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The active strategy had nothing to offer
    #[error("no forwarder available")]
    NoForwarder,

    #[error("invalid target {0}")]
    InvalidTarget(String),

    #[error("dial {target} via {}: {source}", .forwarder.address())]
    Dial {
        forwarder: Arc<Forwarder>,
        target: String,
        #[source]
        source: GateError,
    },
}

/// True when an error message names the proxy's own listen address
pub fn references_listener(message: &str, listen_addr: &str) -> bool {
    !listen_addr.is_empty() && message.contains(listen_addr)
}

/// Selects forwarders through the active strategy and dials targets
pub struct Dispatcher {
    selector: Arc<dyn ProxySelector>,
    recorder: Arc<dyn HealthRecorder>,
    listen_addr: String,
    connect_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        selector: Arc<dyn ProxySelector>,
        recorder: Arc<dyn HealthRecorder>,
        listen_addr: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            selector,
            recorder,
            listen_addr: listen_addr.into(),
            connect_timeout,
        }
    }

    /// Dial `target` (`host:port`) through the forwarder the strategy picks
    ///
    /// A failed dial is recorded against the forwarder exactly once here, so callers
    /// must not record it again. There is no retry.
    #[instrument(skip(self), fields(strategy = self.selector.strategy_name()))]
    pub async fn dial(&self, target: &str) -> Result<Dispatched, DispatchError> {
        let (host, port) = parse_authority(target, 80)
            .map_err(|_| DispatchError::InvalidTarget(target.to_string()))?;

        let forwarder = self
            .selector
            .select(target)
            .await
            .ok_or(DispatchError::NoForwarder)?;

        debug!(forwarder = %forwarder.address(), "Dialing");

        let result = timeout(
            self.connect_timeout,
            ProxyTransport::connect(&forwarder, &host, port),
        )
        .await;

        let source = match result {
            Ok(Ok(connection)) => {
                return Ok(Dispatched {
                    connection,
                    forwarder,
                })
            }
            Ok(Err(e)) => e,
            Err(_) => GateError::Timeout,
        };

        if !references_listener(&source.to_string(), &self.listen_addr) {
            self.recorder.record(&forwarder, false);
        }

        warn!(forwarder = %forwarder.address(), "Dial failed: {}", source);

        Err(DispatchError::Dial {
            forwarder,
            target: target.to_string(),
            source,
        })
    }

    /// Record a relay failure unless it originated on the client side
    ///
    /// Returns true when a failure was recorded.
    pub fn record_relay_failure(&self, forwarder: &Forwarder, error: &RelayError) -> bool {
        if error.side == Side::Left || references_listener(&error.to_string(), &self.listen_addr)
        {
            return false;
        }
        self.recorder.record(forwarder, false);
        true
    }
}
