//! Weighted round-robin provider selection via GCD smoothing. Retained for
//! future free-form routing; the purchase-keyed dispatch in
//! [`super::Router`] never calls into this path today.

use std::sync::{Arc, Mutex};

use crate::error::{ProxyError, Result};
use crate::provider::Provider;

struct State {
    nodes: Vec<Arc<dyn Provider>>,
    last_node_index: i64,
    current_node_weight: u64,
    weight_gcd: u64,
}

pub struct RoundRobin {
    inner: Mutex<State>,
}

impl RoundRobin {
    pub fn new(nodes: Vec<Arc<dyn Provider>>) -> Self {
        let weight_gcd = gcd_all(&nodes);
        let current_node_weight = nodes.first().map(|n| n.weight()).unwrap_or(0);
        Self { inner: Mutex::new(State { nodes, last_node_index: -1, current_node_weight, weight_gcd }) }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("round robin poisoned").nodes.len()
    }

    pub fn set_node(&self, index: usize, node: Arc<dyn Provider>) {
        let mut state = self.inner.lock().expect("round robin poisoned");
        if index >= state.nodes.len() {
            state.nodes.resize_with(index + 1, || node.clone());
        }
        state.nodes[index] = node;
        state.weight_gcd = gcd_all(&state.nodes);
    }

    pub fn delete_node(&self, name: &str) {
        let mut state = self.inner.lock().expect("round robin poisoned");
        state.nodes.retain(|p| p.name() != name);
        state.weight_gcd = gcd_all(&state.nodes);
    }

    /// Advances the cursor and returns the next node whose weight clears the
    /// current smoothed threshold.
    pub fn get_provider(&self) -> Result<Arc<dyn Provider>> {
        let mut state = self.inner.lock().expect("round robin poisoned");
        loop {
            let len = state.nodes.len();
            if len == 0 {
                return Err(ProxyError::FailedSelectProvider);
            }
            if len == 1 {
                return Ok(state.nodes[0].clone());
            }

            state.last_node_index = (state.last_node_index + 1) % len as i64;

            if state.last_node_index == 0 {
                state.current_node_weight = state.current_node_weight.saturating_sub(state.weight_gcd);
                if state.current_node_weight == 0 {
                    state.current_node_weight = max_weight(&state.nodes);
                    if state.current_node_weight == 0 {
                        return Err(ProxyError::FailedSelectProvider);
                    }
                }
            }

            let idx = state.last_node_index as usize;
            if state.nodes[idx].weight() >= state.current_node_weight {
                return Ok(state.nodes[idx].clone());
            }
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn gcd_all(nodes: &[Arc<dyn Provider>]) -> u64 {
    nodes.iter().map(|n| n.weight()).fold(0, gcd)
}

fn max_weight(nodes: &[Arc<dyn Provider>]) -> u64 {
    nodes.iter().map(|n| n.weight()).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticProvider;
    use crate::request::Protocol;

    fn weighted_node(name: &'static str, weight: u64) -> Arc<dyn Provider> {
        Arc::new(StaticProvider::new(name, "127.0.0.1:1", b"u".to_vec(), b"p".to_vec(), weight, Protocol::Http))
    }

    #[test]
    fn empty_pool_fails_to_select() {
        let rr = RoundRobin::new(Vec::new());
        assert!(rr.get_provider().is_err());
    }

    #[test]
    fn single_node_always_returned() {
        let rr = RoundRobin::new(vec![weighted_node("solo", 5)]);
        for _ in 0..10 {
            assert_eq!(rr.get_provider().unwrap().name(), "solo");
        }
    }

    #[test]
    fn heavier_node_is_selected_more_often() {
        let rr = RoundRobin::new(vec![weighted_node("heavy", 3), weighted_node("light", 1)]);
        let mut heavy_count = 0;
        let mut light_count = 0;
        for _ in 0..16 {
            match rr.get_provider().unwrap().name() {
                "heavy" => heavy_count += 1,
                "light" => light_count += 1,
                _ => unreachable!(),
            }
        }
        assert!(heavy_count > light_count);
    }

    #[test]
    fn delete_node_shrinks_pool() {
        let rr = RoundRobin::new(vec![weighted_node("a", 1), weighted_node("b", 1)]);
        rr.delete_node("a");
        assert_eq!(rr.size(), 1);
        assert_eq!(rr.get_provider().unwrap().name(), "b");
    }
}
