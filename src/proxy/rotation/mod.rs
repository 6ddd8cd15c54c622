//! Forwarder selection strategies
//!
//! This module provides the strategies used to pick one forwarder per dispatch.

mod controlled;
mod dest_hash;
mod high_availability;
mod pool;
mod round_robin;

pub use controlled::{ControlledSelector, PoolDraw};
pub use dest_hash::DestinationHashSelector;
pub use high_availability::HighAvailabilitySelector;
pub use pool::ForwarderPool;
pub use round_robin::RoundRobinSelector;

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::Forwarder;

/// Strategy types for forwarder selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    HighAvailability,
    LatencyHighAvailability,
    DestinationHash,
    Controlled,
}

impl RotationStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ha" | "high_availability" | "high-availability" => Self::HighAvailability,
            "lha" | "latency" | "latency_ha" | "latency-ha" => Self::LatencyHighAvailability,
            "dh" | "destination_hash" | "destination-hash" => Self::DestinationHash,
            "api" | "controlled" => Self::Controlled,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "rr",
            Self::HighAvailability => "ha",
            Self::LatencyHighAvailability => "lha",
            Self::DestinationHash => "dh",
            Self::Controlled => "api",
        }
    }
}

/// Trait for forwarder selection strategies
///
/// Implementations of this trait provide different algorithms for
/// selecting one forwarder from the configured pool.
#[async_trait]
pub trait ProxySelector: Send + Sync {
    /// Select a forwarder for a connection to `target`
    ///
    /// Returns `None` when the pool is empty. This is a normal outcome, not a fault.
    async fn select(&self, target: &str) -> Option<Arc<Forwarder>>;

    /// Atomically replace the pool
    fn set_pool(&self, forwarders: Vec<Arc<Forwarder>>);

    /// Snapshot of the whole pool in configuration order
    fn forwarders(&self) -> Vec<Arc<Forwarder>>;

    /// Get the number of forwarders currently eligible for selection
    fn available_count(&self) -> usize;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create a forwarder selector based on the strategy type
///
/// The controlled strategy is backed by the shared selector the control API drives.
pub fn create_selector(
    strategy: RotationStrategy,
    controlled: &Arc<ControlledSelector>,
) -> Arc<dyn ProxySelector> {
    match strategy {
        RotationStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
        RotationStrategy::HighAvailability => Arc::new(HighAvailabilitySelector::new()),
        RotationStrategy::LatencyHighAvailability => {
            Arc::new(HighAvailabilitySelector::latency_based())
        }
        RotationStrategy::DestinationHash => Arc::new(DestinationHashSelector::new()),
        RotationStrategy::Controlled => controlled.clone(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::models::{Forwarder, ForwarderProtocol};

    pub fn forwarder(address: &str, priority: u32) -> Arc<Forwarder> {
        Arc::new(Forwarder::new(address, ForwarderProtocol::Http, priority))
    }
}
