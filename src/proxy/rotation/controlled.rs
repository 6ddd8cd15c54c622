//! Externally controlled forwarder selection
//!
//! One forwarder is pinned as "current" and every dispatch uses it until the control
//! plane rotates or pins another one.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info};

use super::ProxySelector;
use crate::models::Forwarder;

/// Draws made by `rotate` before accepting a collision with the current forwarder
const MAX_ROTATE_ATTEMPTS: usize = 3;

/// Uniform index source used for pinning and rotation
pub trait PoolDraw: Send {
    /// Return an index in `0..len`. `len` is never zero.
    fn draw(&mut self, len: usize) -> usize;
}

impl PoolDraw for StdRng {
    fn draw(&mut self, len: usize) -> usize {
        self.gen_range(0..len)
    }
}

struct SelectionState<D> {
    pool: Vec<Arc<Forwarder>>,
    current: Option<Arc<Forwarder>>,
    draw: D,
}

impl<D: PoolDraw> SelectionState<D> {
    fn pick(&mut self) -> Arc<Forwarder> {
        let idx = self.draw.draw(self.pool.len());
        self.pool[idx].clone()
    }
}

/// Pool plus a pinned current forwarder, all guarded by one lock
///
/// Every operation takes the lock once, so concurrent `current`, `rotate`, `pin` and
/// `set_pool` calls are linearizable and `current` is always a member of the pool.
pub struct ControlledSelector<D = StdRng> {
    state: Mutex<SelectionState<D>>,
}

impl ControlledSelector<StdRng> {
    pub fn new() -> Self {
        Self::with_draw(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_draw(StdRng::seed_from_u64(seed))
    }
}

impl Default for ControlledSelector<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: PoolDraw> ControlledSelector<D> {
    pub fn with_draw(draw: D) -> Self {
        Self {
            state: Mutex::new(SelectionState {
                pool: Vec::new(),
                current: None,
                draw,
            }),
        }
    }

    /// Replace the pool and clear the pinned forwarder
    pub fn set_pool(&self, forwarders: Vec<Arc<Forwarder>>) {
        let mut state = self.state.lock();
        state.pool = forwarders;
        state.current = None;
        info!(count = state.pool.len(), "Forwarder pool updated");
    }

    /// Return the pinned forwarder, pinning a random one first if nothing is pinned
    pub fn current(&self) -> Option<Arc<Forwarder>> {
        let mut state = self.state.lock();
        if state.pool.is_empty() {
            return None;
        }

        if let Some(current) = &state.current {
            return Some(current.clone());
        }

        let picked = state.pick();
        debug!(forwarder = %picked.address(), "Pinned initial forwarder");
        state.current = Some(picked.clone());
        Some(picked)
    }

    /// Pin a randomly drawn forwarder, preferring one other than the current
    ///
    /// Up to three draws are made; if all of them hit the current forwarder the last
    /// draw is accepted anyway.
    pub fn rotate(&self) -> Option<Arc<Forwarder>> {
        let mut state = self.state.lock();
        if state.pool.is_empty() {
            debug!("Rotation requested with an empty pool");
            return None;
        }

        let previous = state.current.clone();

        let next = if state.pool.len() == 1 {
            state.pool[0].clone()
        } else {
            let mut candidate = state.pick();
            for _ in 1..MAX_ROTATE_ATTEMPTS {
                match &previous {
                    Some(prev) if prev.address() == candidate.address() => {
                        candidate = state.pick();
                    }
                    _ => break,
                }
            }
            candidate
        };

        info!(
            from = previous.as_ref().map(|f| f.address()).unwrap_or("none"),
            to = %next.address(),
            "Rotated forwarder"
        );
        state.current = Some(next.clone());
        Some(next)
    }

    /// Pin the forwarder with the given address
    pub fn pin(&self, address: &str) -> Option<Arc<Forwarder>> {
        let mut state = self.state.lock();
        let found = state.pool.iter().find(|f| f.address() == address).cloned()?;
        info!(forwarder = %found.address(), "Pinned forwarder");
        state.current = Some(found.clone());
        Some(found)
    }

    /// The pinned forwarder without pinning one
    pub fn pinned(&self) -> Option<Arc<Forwarder>> {
        self.state.lock().current.clone()
    }

    /// Snapshot of the pool in configuration order
    pub fn forwarders(&self) -> Vec<Arc<Forwarder>> {
        self.state.lock().pool.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<D: PoolDraw + 'static> ProxySelector for ControlledSelector<D> {
    async fn select(&self, _target: &str) -> Option<Arc<Forwarder>> {
        self.current()
    }

    fn set_pool(&self, forwarders: Vec<Arc<Forwarder>>) {
        ControlledSelector::set_pool(self, forwarders);
    }

    fn forwarders(&self) -> Vec<Arc<Forwarder>> {
        ControlledSelector::forwarders(self)
    }

    fn available_count(&self) -> usize {
        self.len()
    }

    fn strategy_name(&self) -> &'static str {
        "api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::test_support::forwarder;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of draws
    struct Scripted(VecDeque<usize>);

    impl Scripted {
        fn new(draws: &[usize]) -> Self {
            Self(draws.iter().copied().collect())
        }
    }

    impl PoolDraw for Scripted {
        fn draw(&mut self, len: usize) -> usize {
            self.0.pop_front().unwrap_or(0) % len
        }
    }

    fn pool(addresses: &[&str]) -> Vec<Arc<Forwarder>> {
        addresses.iter().map(|a| forwarder(a, 0)).collect()
    }

    fn assert_pinned_is_member<D: PoolDraw>(selector: &ControlledSelector<D>) {
        if let Some(current) = selector.pinned() {
            assert!(
                selector
                    .forwarders()
                    .iter()
                    .any(|f| f.address() == current.address()),
                "pinned {} is not in the pool",
                current.address()
            );
        }
    }

    #[test]
    fn test_empty_pool_has_no_current() {
        let selector = ControlledSelector::with_seed(1);
        assert!(selector.current().is_none());
        assert!(selector.rotate().is_none());
        assert!(selector.pin("10.0.0.1:80").is_none());
        assert!(selector.pinned().is_none());
    }

    #[test]
    fn test_current_auto_pins_and_is_stable() {
        let selector = ControlledSelector::with_seed(42);
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]));
        assert!(selector.pinned().is_none());

        let first = selector.current().unwrap();
        for _ in 0..10 {
            assert_eq!(selector.current().unwrap().address(), first.address());
        }
        assert_eq!(selector.pinned().unwrap().address(), first.address());
    }

    #[test]
    fn test_rotate_moves_to_other_forwarder() {
        let selector = ControlledSelector::with_draw(Scripted::new(&[0, 0, 1]));
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80"]));

        assert_eq!(selector.current().unwrap().address(), "10.0.0.1:80");
        assert_eq!(selector.rotate().unwrap().address(), "10.0.0.2:80");
        assert_eq!(selector.current().unwrap().address(), "10.0.0.2:80");
    }

    #[test]
    fn test_rotate_accepts_third_collision() {
        let selector = ControlledSelector::with_draw(Scripted::new(&[1, 1, 1, 1]));
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80"]));

        assert_eq!(selector.current().unwrap().address(), "10.0.0.2:80");
        assert_eq!(selector.rotate().unwrap().address(), "10.0.0.2:80");
    }

    #[test]
    fn test_rotate_usually_changes_forwarder() {
        let selector = ControlledSelector::with_seed(2024);
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80"]));

        let mut changed = 0;
        for _ in 0..200 {
            let before = selector.current().unwrap();
            let after = selector.rotate().unwrap();
            if before.address() != after.address() {
                changed += 1;
            }
        }
        // Expected 7 in 8 rotations change the forwarder
        assert!(changed > 150, "only {} of 200 rotations changed", changed);
    }

    #[test]
    fn test_single_forwarder_rotation() {
        let selector = ControlledSelector::with_seed(3);
        selector.set_pool(pool(&["10.0.0.1:80"]));

        for _ in 0..5 {
            assert_eq!(selector.rotate().unwrap().address(), "10.0.0.1:80");
        }
        assert_eq!(selector.current().unwrap().address(), "10.0.0.1:80");
    }

    #[test]
    fn test_set_pool_clears_current() {
        let selector = ControlledSelector::with_seed(5);
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80"]));
        selector.current().unwrap();

        selector.set_pool(pool(&["10.0.0.3:80", "10.0.0.4:80"]));
        assert!(selector.pinned().is_none());

        let current = selector.current().unwrap();
        assert!(["10.0.0.3:80", "10.0.0.4:80"].contains(&current.address()));
    }

    #[test]
    fn test_set_pool_copies_caller_list() {
        let selector = ControlledSelector::with_seed(6);
        let mut list = pool(&["10.0.0.1:80", "10.0.0.2:80"]);
        selector.set_pool(list.clone());

        list.push(forwarder("10.0.0.3:80", 0));
        list.remove(0);

        let addresses: Vec<String> = selector
            .forwarders()
            .iter()
            .map(|f| f.address().to_string())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[test]
    fn test_pin_by_address() {
        let selector = ControlledSelector::with_seed(8);
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]));

        assert_eq!(selector.pin("10.0.0.3:80").unwrap().address(), "10.0.0.3:80");
        assert_eq!(selector.current().unwrap().address(), "10.0.0.3:80");

        assert!(selector.pin("10.9.9.9:80").is_none());
        assert_eq!(selector.current().unwrap().address(), "10.0.0.3:80");
    }

    #[test]
    fn test_pinned_always_member_under_random_operations() {
        let selector = ControlledSelector::with_seed(11);
        let mut ops = StdRng::seed_from_u64(99);
        let pools = [
            pool(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]),
            pool(&["10.0.1.1:80"]),
            Vec::new(),
            pool(&["10.0.2.1:80", "10.0.2.2:80"]),
        ];

        for _ in 0..500 {
            match ops.gen_range(0..4) {
                0 => {
                    let next = pools[ops.gen_range(0..pools.len())].clone();
                    selector.set_pool(next);
                }
                1 => {
                    selector.current();
                }
                2 => {
                    selector.rotate();
                }
                _ => {
                    selector.pin("10.0.2.2:80");
                }
            }
            assert_pinned_is_member(&selector);
        }
    }

    #[test]
    fn test_concurrent_access_keeps_pinned_member() {
        let selector = Arc::new(ControlledSelector::with_seed(13));
        selector.set_pool(pool(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let selector = selector.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        match (worker + i) % 3 {
                            0 => {
                                selector.rotate();
                            }
                            1 => {
                                selector.current();
                            }
                            _ => {
                                let list = if i % 2 == 0 {
                                    pool(&["10.0.0.1:80", "10.0.0.2:80"])
                                } else {
                                    pool(&["10.0.0.7:80", "10.0.0.8:80", "10.0.0.9:80"])
                                };
                                selector.set_pool(list);
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_pinned_is_member(&selector);
        let current = selector.current().unwrap();
        assert!(selector
            .forwarders()
            .iter()
            .any(|f| f.address() == current.address()));
    }
}
