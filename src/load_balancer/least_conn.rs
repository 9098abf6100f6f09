//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Least connections selector.
/// Selects the alive backend with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // Strict `<` keeps the earliest registered backend on ties.
        let mut selected: Option<&Arc<Backend>> = None;
        let mut min = i64::MAX;
        for backend in backends {
            if !backend.is_alive() {
                continue;
            }
            let conns = backend.connections();
            if selected.is_none() || conns < min {
                min = conns;
                selected = Some(backend);
            }
        }
        selected.cloned()
    }
}
