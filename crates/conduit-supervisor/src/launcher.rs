//! Worker launching.
//!
//! A `WorkerLauncher` turns a `LaunchSpec` into a running worker on some
//! node and hands back an opaque worker reference. The supervisor only
//! ever talks to workers through this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use conduit_core::{ConnectorConfig, WorkloadKind};
use conduit_state::PackageHandle;

/// Everything a worker needs to run one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub kind: WorkloadKind,
    pub connector_key: String,
    pub instance_id: u32,
    pub generation: u64,
    pub package: PackageHandle,
    pub config: ConnectorConfig,
}

/// Errors reported by a launcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("worker node {node} rejected launch: {reason}")]
    Rejected { node: String, reason: String },

    #[error("worker {worker} unreachable: {reason}")]
    Unreachable { worker: String, reason: String },

    #[error("unknown worker node: {0}")]
    UnknownNode(String),
}

/// Trait for worker launching implementations.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start one instance on `node`. Returns the worker reference.
    async fn launch(&self, node: &str, spec: &LaunchSpec) -> Result<String, LaunchError>;

    /// Stop a worker. Stopping an unknown worker succeeds.
    async fn terminate(&self, worker: &str) -> Result<(), LaunchError>;

    /// Whether the worker is still running.
    async fn is_alive(&self, worker: &str) -> bool;
}

struct LocalWorker {
    spec: LaunchSpec,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs each instance as a tokio task inside the daemon process.
///
/// Also used as the launcher in tests: launches and terminations can be
/// made to fail, and launches can be slowed down.
pub struct LocalLauncher {
    nodes: Vec<String>,
    workers: Mutex<HashMap<String, LocalWorker>>,
    seq: AtomicU64,
    failing_launches: AtomicU32,
    failing_terminates: AtomicU32,
    launch_delay_ms: AtomicU64,
}

impl LocalLauncher {
    /// Create a launcher that accepts placements on `nodes`.
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            workers: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            failing_launches: AtomicU32::new(0),
            failing_terminates: AtomicU32::new(0),
            launch_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `count` launches fail.
    pub fn fail_next_launches(&self, count: u32) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` terminations fail.
    pub fn fail_next_terminates(&self, count: u32) {
        self.failing_terminates.store(count, Ordering::SeqCst);
    }

    /// Delay every launch by `delay`.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Kill a worker without going through `terminate`, as if it crashed.
    pub async fn kill(&self, worker: &str) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(worker) {
            Some(w) => {
                w.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Specs of all live workers, ordered by connector and instance id.
    pub async fn running(&self) -> Vec<LaunchSpec> {
        let workers = self.workers.lock().await;
        let mut specs: Vec<LaunchSpec> = workers
            .values()
            .filter(|w| !w.handle.is_finished())
            .map(|w| w.spec.clone())
            .collect();
        specs.sort_by(|a, b| {
            (a.connector_key.as_str(), a.instance_id).cmp(&(b.connector_key.as_str(), b.instance_id))
        });
        specs
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self, node: &str, spec: &LaunchSpec) -> Result<String, LaunchError> {
        if !self.nodes.iter().any(|n| n == node) {
            return Err(LaunchError::UnknownNode(node.to_string()));
        }

        let delay = self.launch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if Self::take_failure(&self.failing_launches) {
            return Err(LaunchError::Rejected {
                node: node.to_string(),
                reason: "injected launch failure".to_string(),
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let worker = format!(
            "{node}/{}#{}@g{}-{seq}",
            spec.connector_key, spec.instance_id, spec.generation
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = worker.clone();
        let handle = tokio::spawn(async move {
            debug!(worker = %name, "worker started");
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            debug!(worker = %name, "worker exited");
        });

        info!(
            worker = %worker,
            kind = %spec.kind,
            package = %spec.package.location,
            "launched instance"
        );

        self.workers.lock().await.insert(
            worker.clone(),
            LocalWorker {
                spec: spec.clone(),
                shutdown_tx,
                handle,
            },
        );
        Ok(worker)
    }

    async fn terminate(&self, worker: &str) -> Result<(), LaunchError> {
        if Self::take_failure(&self.failing_terminates) {
            return Err(LaunchError::Unreachable {
                worker: worker.to_string(),
                reason: "injected terminate failure".to_string(),
            });
        }

        let removed = self.workers.lock().await.remove(worker);
        if let Some(w) = removed {
            let _ = w.shutdown_tx.send(true);
            let _ = w.handle.await;
            debug!(worker, "terminated worker");
        }
        Ok(())
    }

    async fn is_alive(&self, worker: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(worker)
            .is_some_and(|w| !w.handle.is_finished())
    }
}
