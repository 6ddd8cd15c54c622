//! Shared forwarder pool for the pool-based strategies

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::models::Forwarder;

/// Pool of forwarders replaced as a whole
///
/// Readers load a consistent snapshot without locking; `replace` swaps the entire
/// list in one store so no reader ever sees a partially updated pool.
pub struct ForwarderPool {
    forwarders: ArcSwap<Vec<Arc<Forwarder>>>,
}

impl ForwarderPool {
    pub fn new() -> Self {
        Self {
            forwarders: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn replace(&self, forwarders: Vec<Arc<Forwarder>>) {
        self.forwarders.store(Arc::new(forwarders));
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Forwarder>>> {
        self.forwarders.load_full()
    }

    pub fn len(&self) -> usize {
        self.forwarders.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forwarders eligible for selection
    ///
    /// Enabled forwarders sharing the highest priority among enabled ones. When nothing
    /// is enabled the first configured forwarder is returned alone so traffic keeps
    /// flowing while the health checker catches up.
    pub fn available(&self) -> Vec<Arc<Forwarder>> {
        let forwarders = self.forwarders.load();

        let top = forwarders
            .iter()
            .filter(|f| f.enabled())
            .map(|f| f.priority())
            .max();

        match top {
            Some(priority) => forwarders
                .iter()
                .filter(|f| f.enabled() && f.priority() == priority)
                .cloned()
                .collect(),
            None => forwarders.first().cloned().into_iter().collect(),
        }
    }
}

impl Default for ForwarderPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::test_support::forwarder;

    fn addresses(list: &[Arc<Forwarder>]) -> Vec<&str> {
        list.iter().map(|f| f.address()).collect()
    }

    #[test]
    fn test_available_empty_pool() {
        let pool = ForwarderPool::new();
        assert!(pool.available().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_available_keeps_highest_enabled_priority() {
        let pool = ForwarderPool::new();
        let low = forwarder("10.0.0.1:80", 1);
        let high_a = forwarder("10.0.0.2:80", 5);
        let high_b = forwarder("10.0.0.3:80", 5);
        pool.replace(vec![low.clone(), high_a.clone(), high_b.clone()]);

        assert_eq!(
            addresses(&pool.available()),
            vec!["10.0.0.2:80", "10.0.0.3:80"]
        );

        high_a.disable();
        high_b.disable();
        assert_eq!(addresses(&pool.available()), vec!["10.0.0.1:80"]);
    }

    #[test]
    fn test_available_falls_back_to_first_when_all_disabled() {
        let pool = ForwarderPool::new();
        let a = forwarder("10.0.0.1:80", 0);
        let b = forwarder("10.0.0.2:80", 9);
        a.disable();
        b.disable();
        pool.replace(vec![a, b]);

        assert_eq!(addresses(&pool.available()), vec!["10.0.0.1:80"]);
    }

    #[test]
    fn test_replace_swaps_whole_pool() {
        let pool = ForwarderPool::new();
        pool.replace(vec![forwarder("10.0.0.1:80", 0)]);
        let before = pool.snapshot();

        pool.replace(vec![forwarder("10.0.0.8:80", 0), forwarder("10.0.0.9:80", 0)]);

        assert_eq!(before.len(), 1);
        assert_eq!(pool.len(), 2);
        assert_eq!(
            addresses(&pool.snapshot()),
            vec!["10.0.0.8:80", "10.0.0.9:80"]
        );
    }
}
