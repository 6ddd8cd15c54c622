//! Destination-hash forwarder selection strategy

use async_trait::async_trait;
use std::sync::Arc;

use super::{ForwarderPool, ProxySelector};
use crate::models::Forwarder;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a
fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps each destination to the same available forwarder while the available set is stable
pub struct DestinationHashSelector {
    pool: ForwarderPool,
}

impl DestinationHashSelector {
    pub fn new() -> Self {
        Self {
            pool: ForwarderPool::new(),
        }
    }
}

impl Default for DestinationHashSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxySelector for DestinationHashSelector {
    async fn select(&self, target: &str) -> Option<Arc<Forwarder>> {
        let available = self.pool.available();
        if available.is_empty() {
            return None;
        }

        let idx = fnv1a(target.as_bytes()) as usize % available.len();
        available.get(idx).cloned()
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
        "dh"
    }
}
