//! High-availability forwarder selection strategies

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{ForwarderPool, ProxySelector};
use crate::models::Forwarder;

/// Sticks to one available forwarder until it drops out
///
/// The plain variant always picks the first available forwarder in configuration
/// order. The latency variant picks the available forwarder with the lowest measured
/// latency; forwarders with no measurement rank after every measured one.
pub struct HighAvailabilitySelector {
    pool: ForwarderPool,
    by_latency: bool,
}

impl HighAvailabilitySelector {
    pub fn new() -> Self {
        Self {
            pool: ForwarderPool::new(),
            by_latency: false,
        }
    }

    pub fn latency_based() -> Self {
        Self {
            pool: ForwarderPool::new(),
            by_latency: true,
        }
    }
}

impl Default for HighAvailabilitySelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxySelector for HighAvailabilitySelector {
    async fn select(&self, _target: &str) -> Option<Arc<Forwarder>> {
        let available = self.pool.available();

        if !self.by_latency {
            return available.into_iter().next();
        }

        // min_by_key keeps the first of equal keys, so ties go to configuration order
        available
            .into_iter()
            .min_by_key(|f| f.latency().unwrap_or(Duration::MAX))
    }

    fn set_pool(&self, forwarders: Vec<Arc<Forwarder>>) {
        self.pool.replace(forwarders);
    }

    fn forwarders(&self) -> Vec<Arc<Forwarder>> {
        self.pool.snapshot().as_ref().clone()
    }

    fn available_count(&self) -> usize {
        self.pool.available().len()
    }

    fn strategy_name(&self) -> &'static str {
        if self.by_latency {
            "lha"
        } else {
            "ha"
        }
    }
}
