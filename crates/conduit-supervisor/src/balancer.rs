//! Worker node placement.
//!
//! Instances are spread over the configured worker nodes in turn. The
//! cursor is a shared atomic so concurrent launches within one
//! reconciliation still alternate nodes.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::error::{SupervisorError, SupervisorResult};

/// The worker nodes instances can be placed on.
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<String>,
    cursor: AtomicUsize,
}

impl NodePool {
    /// Build a pool from node names. Blank and repeated names are dropped;
    /// at least one node must remain.
    pub fn new(nodes: Vec<String>) -> SupervisorResult<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(nodes.len());
        for node in nodes {
            let node = node.trim();
            if node.is_empty() {
                continue;
            }
            if unique.iter().any(|n| n == node) {
                warn!(node, "duplicate worker node ignored");
                continue;
            }
            unique.push(node.to_string());
        }
        if unique.is_empty() {
            return Err(SupervisorError::NoWorkerNodes);
        }
        Ok(Self {
            nodes: unique,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Node for the next placement attempt.
    pub fn next_node(&self) -> &str {
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.nodes[turn % self.nodes.len()]
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(names: &[&str]) -> SupervisorResult<NodePool> {
        NodePool::new(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn placements_alternate_nodes() {
        let pool = pool(&["a", "b", "c"]).unwrap();
        let picked: Vec<&str> = (0..4).map(|_| pool.next_node()).collect();
        assert_eq!(picked, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn blank_and_duplicate_nodes_dropped() {
        let pool = pool(&["a", " ", "a", "b "]).unwrap();
        assert_eq!(pool.nodes(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn empty_pool_rejected() {
        assert!(matches!(pool(&[]), Err(SupervisorError::NoWorkerNodes)));
        assert!(matches!(pool(&[""]), Err(SupervisorError::NoWorkerNodes)));
    }

    #[test]
    fn concurrent_placements_stay_in_range() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(pool(&["a", "b"]).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| pool.next_node().to_string())
                        .filter(|n| n == "a")
                        .count()
                })
            })
            .collect();

        let on_a: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(on_a, 100);
    }
}
