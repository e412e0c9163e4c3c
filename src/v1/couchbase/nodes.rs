use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

/// Picks the node that receives per-node administrative requests.
pub trait NodeSelector: Send + Sync {
    fn select<'n>(&self, nodes: &'n [String]) -> Option<&'n String>;
}

#[derive(Debug, Default)]
pub struct RandomNodeSelector;

impl NodeSelector for RandomNodeSelector {
    fn select<'n>(&self, nodes: &'n [String]) -> Option<&'n String> {
        nodes.choose(&mut rand::thread_rng())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinNodeSelector {
    next: AtomicUsize,
}

impl NodeSelector for RoundRobinNodeSelector {
    fn select<'n>(&self, nodes: &'n [String]) -> Option<&'n String> {
        if nodes.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        nodes.get(turn % nodes.len())
    }
}
