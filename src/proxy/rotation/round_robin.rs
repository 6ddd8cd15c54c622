//! Round-robin forwarder selection strategy

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ForwarderPool, ProxySelector};
use crate::models::Forwarder;

/// Selects available forwarders in round-robin order
///
/// Uses atomic operations for lock-free index tracking.
pub struct RoundRobinSelector {
    pool: ForwarderPool,
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            pool: ForwarderPool::new(),
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxySelector for RoundRobinSelector {
    async fn select(&self, _target: &str) -> Option<Arc<Forwarder>> {
        let available = self.pool.available();
        if available.is_empty() {
            return None;
        }

        // Atomically increment and get the previous value, then wrap around
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % available.len();
        available.get(idx).cloned()
    }

    fn set_pool(&self, forwarders: Vec<Arc<Forwarder>>) {
        self.pool.replace(forwarders);
        self.index.store(0, Ordering::Relaxed);
    }

    fn forwarders(&self) -> Vec<Arc<Forwarder>> {
        self.pool.snapshot().as_ref().clone()
    }

    fn available_count(&self) -> usize {
        self.pool.available().len()
    }

    fn strategy_name(&self) -> &'static str {
        "rr"
    }
}
