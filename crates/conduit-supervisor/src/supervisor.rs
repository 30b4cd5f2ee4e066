//! InstanceSupervisor: keeps one connector's instances converged.
//!
//! Each registered connector owns one supervisor. The supervisor:
//! - Reconciles the persisted instance records against the desired state
//!   (count, package, config, generation)
//! - Stops excess and stale instances before launching replacements
//! - Restarts and stops individual instances on request
//! - Tears everything down when the connector is removed
//! - Relaunches instances whose worker died
//!
//! All actuation for a connector is serialized by one mutex. Status reads
//! go straight to the state store and never wait on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use conduit_core::{ConnectorConfig, WorkloadKind};
use conduit_state::*;

use crate::balancer::NodePool;
use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::{LaunchError, LaunchSpec, WorkerLauncher};
use crate::retry::RetryPolicy;

/// What the supervisor converges towards.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub instances: u32,
    pub generation: u64,
    pub package: PackageHandle,
    pub config: ConnectorConfig,
}

impl DesiredState {
    pub fn from_record(record: &ConnectorRecord) -> Self {
        Self {
            instances: record.desired_instances(),
            generation: record.generation,
            package: record.package.clone(),
            config: record.config.clone(),
        }
    }
}

/// Outcome of one actuation pass, by instance id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<u32>,
    pub stopped: Vec<u32>,
    pub failed: Vec<u32>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn sort(&mut self) {
        self.started.sort_unstable();
        self.stopped.sort_unstable();
        self.failed.sort_unstable();
    }
}

/// Connector-wide view over its instances.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStatus {
    pub num_instances: u32,
    pub num_running: u32,
    pub healthy: bool,
    pub instances: Vec<InstanceRecord>,
}

/// Retry budgets for actuation.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    pub start_retry: RetryPolicy,
    pub stop_retry: RetryPolicy,
}

/// The pieces a launch or release needs, cheap to clone into tasks.
#[derive(Clone)]
struct Actuator {
    kind: WorkloadKind,
    key: String,
    store: StateStore,
    launcher: Arc<dyn WorkerLauncher>,
    nodes: Arc<NodePool>,
    options: Arc<SupervisorOptions>,
}

impl Actuator {
    /// Launch `record` with bounded retries and persist the outcome.
    ///
    /// The record is persisted as starting (or restarting) before the
    /// launch so a concurrent status read never sees a stale worker.
    async fn start(
        &self,
        mut record: InstanceRecord,
        desired: &DesiredState,
    ) -> SupervisorResult<InstanceRecord> {
        record.generation = desired.generation;
        record.worker = None;
        if record.status != InstanceStatus::Restarting {
            record.status = InstanceStatus::Starting;
        }
        record.updated_at = epoch_secs();
        self.store.put_instance(&record)?;

        let spec = LaunchSpec {
            kind: self.kind,
            connector_key: self.key.clone(),
            instance_id: record.instance_id,
            generation: desired.generation,
            package: desired.package.clone(),
            config: desired.config.clone(),
        };
        let what = format!("launch {}", record.table_key());
        let result = self
            .options
            .start_retry
            .run(&what, |_| {
                let node = self.nodes.next_node().to_string();
                let launcher = self.launcher.clone();
                let spec = spec.clone();
                async move { launcher.launch(&node, &spec).await }
            })
            .await;

        match result {
            Ok(worker) => {
                debug!(key = %self.key, instance_id = record.instance_id, %worker, "instance running");
                record.status = InstanceStatus::Running;
                record.worker = Some(worker);
                record.last_heartbeat = Some(epoch_secs());
                record.last_error = None;
            }
            Err(e) => {
                warn!(key = %self.key, instance_id = record.instance_id, error = %e, "instance failed to start");
                record.status = InstanceStatus::Failed;
                record.last_error = Some(e.to_string());
            }
        }
        record.updated_at = epoch_secs();
        self.store.put_instance(&record)?;
        Ok(record)
    }

    /// Terminate the instance's worker, if it has one.
    async fn release(&self, record: &InstanceRecord) -> Result<(), LaunchError> {
        let Some(worker) = record.worker.clone() else {
            return Ok(());
        };
        let what = format!("terminate {}", record.table_key());
        self.options
            .stop_retry
            .run(&what, |_| {
                let launcher = self.launcher.clone();
                let worker = worker.clone();
                async move { launcher.terminate(&worker).await }
            })
            .await
    }

    fn mark_failed(&self, record: &mut InstanceRecord, error: String) -> SupervisorResult<()> {
        record.status = InstanceStatus::Failed;
        record.last_error = Some(error);
        record.updated_at = epoch_secs();
        self.store.put_instance(record)?;
        Ok(())
    }
}

/// Supervises the instances of one connector.
pub struct InstanceSupervisor {
    actuator: Actuator,
    desired: RwLock<Option<DesiredState>>,
    actuation: Mutex<()>,
    /// Set once teardown starts; nothing is launched afterwards.
    retired: AtomicBool,
}

impl InstanceSupervisor {
    pub fn new(
        kind: WorkloadKind,
        key: String,
        store: StateStore,
        launcher: Arc<dyn WorkerLauncher>,
        nodes: Arc<NodePool>,
        options: Arc<SupervisorOptions>,
    ) -> Self {
        Self {
            actuator: Actuator {
                kind,
                key,
                store,
                launcher,
                nodes,
                options,
            },
            desired: RwLock::new(None),
            actuation: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Currently adopted desired state.
    pub async fn desired(&self) -> Option<DesiredState> {
        self.desired.read().await.clone()
    }

    /// Adopt `desired` unless a newer generation was already seen.
    pub async fn set_desired(&self, desired: DesiredState) -> bool {
        let mut current = self.desired.write().await;
        match current.as_ref() {
            Some(c) if c.generation > desired.generation => {
                debug!(
                    key = %self.actuator.key,
                    seen = c.generation,
                    offered = desired.generation,
                    "ignoring stale desired state"
                );
                false
            }
            _ => {
                *current = Some(desired);
                true
            }
        }
    }

    async fn current_desired(&self) -> SupervisorResult<DesiredState> {
        self.desired
            .read()
            .await
            .clone()
            .ok_or_else(|| SupervisorError::NotConfigured(self.actuator.key.clone()))
    }

    fn check_range(&self, desired: &DesiredState, instance_id: u32) -> SupervisorResult<()> {
        if instance_id >= desired.instances {
            return Err(SupervisorError::InstanceNotFound {
                connector: self.actuator.key.clone(),
                instance_id,
            });
        }
        Ok(())
    }

    fn load_or_placeholder(
        &self,
        desired: &DesiredState,
        instance_id: u32,
    ) -> SupervisorResult<InstanceRecord> {
        Ok(self
            .actuator
            .store
            .get_instance(&self.actuator.key, instance_id)?
            .unwrap_or_else(|| {
                InstanceRecord::new(&self.actuator.key, instance_id, desired.generation)
            }))
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Converge the instances towards `desired`. Idempotent.
    ///
    /// An offer older than the newest generation seen is ignored and an
    /// empty report is returned.
    pub async fn ensure_instances(&self, desired: DesiredState) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        if self.is_retired() || !self.set_desired(desired).await {
            return Ok(ReconcileReport::default());
        }
        let desired = self.current_desired().await?;
        self.reconcile_locked(&desired).await
    }

    async fn reconcile_locked(&self, desired: &DesiredState) -> SupervisorResult<ReconcileReport> {
        let act = &self.actuator;
        let mut report = ReconcileReport::default();
        let mut blocked = Vec::new();

        // Phase 1: stop everything that must not survive, before any launch.
        for mut inst in act.store.list_instances(&act.key)? {
            let id = inst.instance_id;
            if id >= desired.instances {
                match act.release(&inst).await {
                    Ok(()) => {
                        act.store.delete_instance(&act.key, id)?;
                        report.stopped.push(id);
                    }
                    Err(e) => {
                        act.mark_failed(&mut inst, e.to_string())?;
                        if inst.generation != desired.generation {
                            blocked.push(id);
                        }
                        report.failed.push(id);
                    }
                }
            } else if inst.generation != desired.generation && inst.worker.is_some() {
                match act.release(&inst).await {
                    Ok(()) => {
                        inst.worker = None;
                        inst.status = InstanceStatus::Stopped;
                        inst.updated_at = epoch_secs();
                        act.store.put_instance(&inst)?;
                        report.stopped.push(id);
                    }
                    Err(e) => {
                        act.mark_failed(&mut inst, e.to_string())?;
                        blocked.push(id);
                        report.failed.push(id);
                    }
                }
            }
        }

        // An old worker is still up: launching now would run two
        // generations side by side. The next pass retries the release.
        if !blocked.is_empty() {
            report.sort();
            warn!(
                key = %act.key,
                generation = desired.generation,
                blocked = ?blocked,
                "stale workers still running, new generation held back"
            );
            return Ok(report);
        }

        // Phase 2: launch whatever is missing, stale, failed or dead.
        let current: HashMap<u32, InstanceRecord> = act
            .store
            .list_instances(&act.key)?
            .into_iter()
            .map(|r| (r.instance_id, r))
            .collect();

        let mut to_start = Vec::new();
        for id in 0..desired.instances {
            let Some(record) = current.get(&id) else {
                to_start.push(InstanceRecord::new(&act.key, id, desired.generation));
                continue;
            };
            let stale = record.generation != desired.generation;
            let needs_start = match record.status {
                InstanceStatus::Stopped => stale,
                InstanceStatus::Running => match &record.worker {
                    Some(worker) => stale || !act.launcher.is_alive(worker).await,
                    None => true,
                },
                InstanceStatus::Starting | InstanceStatus::Restarting | InstanceStatus::Failed => {
                    true
                }
            };
            if needs_start {
                to_start.push(record.clone());
            }
        }

        self.start_all(to_start, desired, &mut report).await;
        report.sort();

        info!(
            key = %act.key,
            generation = desired.generation,
            started = report.started.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "reconciled instances"
        );
        Ok(report)
    }

    /// Launch `records` concurrently; each failure stays with its instance.
    async fn start_all(
        &self,
        records: Vec<InstanceRecord>,
        desired: &DesiredState,
        report: &mut ReconcileReport,
    ) {
        let mut tasks = JoinSet::new();
        for record in records {
            let actuator = self.actuator.clone();
            let desired = desired.clone();
            tasks.spawn(async move {
                let id = record.instance_id;
                (id, actuator.start(record, &desired).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(record))) if record.status == InstanceStatus::Running => {
                    report.started.push(id)
                }
                Ok((id, Ok(_))) => report.failed.push(id),
                Ok((id, Err(e))) => {
                    warn!(key = %self.actuator.key, instance_id = id, error = %e, "launch bookkeeping failed");
                    report.failed.push(id);
                }
                Err(e) => warn!(key = %self.actuator.key, error = %e, "launch task panicked"),
            }
        }
    }

    // ── Status ─────────────────────────────────────────────────────

    /// Status of one instance. Unlaunched instances read as starting.
    pub async fn instance_status(&self, instance_id: u32) -> SupervisorResult<InstanceRecord> {
        let desired = self.current_desired().await?;
        self.check_range(&desired, instance_id)?;
        self.load_or_placeholder(&desired, instance_id)
    }

    /// Status of all instances; healthy iff every instance is running.
    pub async fn aggregate_status(&self) -> SupervisorResult<AggregateStatus> {
        let desired = self.current_desired().await?;
        let mut stored: HashMap<u32, InstanceRecord> = self
            .actuator
            .store
            .list_instances(&self.actuator.key)?
            .into_iter()
            .map(|r| (r.instance_id, r))
            .collect();

        let instances: Vec<InstanceRecord> = (0..desired.instances)
            .map(|id| {
                stored.remove(&id).unwrap_or_else(|| {
                    InstanceRecord::new(&self.actuator.key, id, desired.generation)
                })
            })
            .collect();
        let num_running = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count() as u32;

        Ok(AggregateStatus {
            num_instances: desired.instances,
            num_running,
            healthy: num_running == desired.instances,
            instances,
        })
    }

    // ── Restart / stop ─────────────────────────────────────────────

    /// Restart one instance. A stopped instance is simply started.
    pub async fn restart_instance(&self, instance_id: u32) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        let desired = self.current_desired().await?;
        self.check_range(&desired, instance_id)?;
        let record = self.load_or_placeholder(&desired, instance_id)?;
        self.restart_locked(vec![record], &desired).await
    }

    /// Restart every instance.
    pub async fn restart_all(&self) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        let desired = self.current_desired().await?;
        let records = (0..desired.instances)
            .map(|id| self.load_or_placeholder(&desired, id))
            .collect::<SupervisorResult<Vec<_>>>()?;
        self.restart_locked(records, &desired).await
    }

    async fn restart_locked(
        &self,
        records: Vec<InstanceRecord>,
        desired: &DesiredState,
    ) -> SupervisorResult<ReconcileReport> {
        let act = &self.actuator;
        let mut report = ReconcileReport::default();
        if self.is_retired() {
            return Ok(report);
        }
        let mut ready = Vec::with_capacity(records.len());

        for mut record in records {
            record.status = InstanceStatus::Restarting;
            record.restart_count += 1;
            record.updated_at = epoch_secs();
            act.store.put_instance(&record)?;

            match act.release(&record).await {
                Ok(()) => ready.push(record),
                Err(e) => {
                    act.mark_failed(&mut record, e.to_string())?;
                    report.failed.push(record.instance_id);
                }
            }
        }

        self.start_all(ready, desired, &mut report).await;
        report.sort();
        info!(key = %act.key, restarted = report.started.len(), failed = report.failed.len(), "restarted instances");
        Ok(report)
    }

    /// Stop one instance; the record is kept as stopped.
    pub async fn stop_instance(&self, instance_id: u32) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        let desired = self.current_desired().await?;
        self.check_range(&desired, instance_id)?;
        let record = self.load_or_placeholder(&desired, instance_id)?;
        self.stop_locked(vec![record]).await
    }

    /// Stop every instance; records are kept as stopped.
    pub async fn stop_all(&self) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        let desired = self.current_desired().await?;
        let records = (0..desired.instances)
            .map(|id| self.load_or_placeholder(&desired, id))
            .collect::<SupervisorResult<Vec<_>>>()?;
        self.stop_locked(records).await
    }

    async fn stop_locked(&self, records: Vec<InstanceRecord>) -> SupervisorResult<ReconcileReport> {
        let act = &self.actuator;
        let mut report = ReconcileReport::default();
        for mut record in records {
            match act.release(&record).await {
                Ok(()) => {
                    record.status = InstanceStatus::Stopped;
                    record.worker = None;
                    record.last_heartbeat = None;
                    record.updated_at = epoch_secs();
                    act.store.put_instance(&record)?;
                    report.stopped.push(record.instance_id);
                }
                Err(e) => {
                    act.mark_failed(&mut record, e.to_string())?;
                    report.failed.push(record.instance_id);
                }
            }
        }
        info!(key = %act.key, stopped = report.stopped.len(), failed = report.failed.len(), "stopped instances");
        Ok(report)
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Stop and forget every instance.
    ///
    /// Instances that cannot be stopped are kept as failed and reported in
    /// `TeardownIncomplete`; calling again retries only those.
    pub async fn teardown(&self) -> SupervisorResult<ReconcileReport> {
        let _guard = self.actuation.lock().await;
        self.retired.store(true, Ordering::SeqCst);
        let act = &self.actuator;
        let mut report = ReconcileReport::default();

        for mut record in act.store.list_instances(&act.key)? {
            let id = record.instance_id;
            match act.release(&record).await {
                Ok(()) => {
                    act.store.delete_instance(&act.key, id)?;
                    report.stopped.push(id);
                }
                Err(e) => {
                    act.mark_failed(&mut record, e.to_string())?;
                    report.failed.push(id);
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(key = %act.key, failed = ?report.failed, "teardown incomplete");
            return Err(SupervisorError::TeardownIncomplete {
                connector: act.key.clone(),
                failed: report.failed,
            });
        }
        info!(key = %act.key, stopped = report.stopped.len(), "torn down instances");
        Ok(report)
    }

    // ── Liveness ───────────────────────────────────────────────────

    /// Confirm running workers are alive and relaunch the dead ones.
    ///
    /// Skipped while another actuation holds the connector.
    pub async fn check_liveness(&self) -> SupervisorResult<ReconcileReport> {
        let Ok(_guard) = self.actuation.try_lock() else {
            debug!(key = %self.actuator.key, "actuation in progress, skipping liveness check");
            return Ok(ReconcileReport::default());
        };
        if self.is_retired() {
            return Ok(ReconcileReport::default());
        }
        let Some(desired) = self.desired.read().await.clone() else {
            return Ok(ReconcileReport::default());
        };

        let act = &self.actuator;
        let mut report = ReconcileReport::default();
        let mut dead = Vec::new();

        for mut record in act.store.list_instances(&act.key)? {
            if record.status != InstanceStatus::Running || record.instance_id >= desired.instances {
                continue;
            }
            let alive = match &record.worker {
                Some(worker) => act.launcher.is_alive(worker).await,
                None => false,
            };
            if alive {
                record.last_heartbeat = Some(epoch_secs());
                act.store.put_instance(&record)?;
                continue;
            }

            if let Err(e) = act.release(&record).await {
                debug!(key = %act.key, instance_id = record.instance_id, error = %e, "could not release dead worker");
            }
            let worker = record.worker.take().unwrap_or_default();
            warn!(key = %act.key, instance_id = record.instance_id, %worker, "worker is not alive");
            act.mark_failed(&mut record, format!("worker {worker} is not alive"))?;
            dead.push(record);
        }

        // One relaunch round for each dead instance.
        let relaunch = dead
            .into_iter()
            .map(|mut record| {
                record.status = InstanceStatus::Restarting;
                record.restart_count += 1;
                record
            })
            .collect();
        self.start_all(relaunch, &desired, &mut report).await;
        report.sort();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LocalLauncher;
    use std::time::Duration;

    struct Harness {
        store: StateStore,
        launcher: Arc<LocalLauncher>,
        supervisor: InstanceSupervisor,
    }

    const KEY: &str = "source/t1/n1/s1";

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let launcher = Arc::new(LocalLauncher::new(vec!["local".to_string()]));
        let nodes = Arc::new(NodePool::new(vec!["local".to_string()]).unwrap());
        let options = Arc::new(SupervisorOptions {
            start_retry: RetryPolicy::immediate(1),
            stop_retry: RetryPolicy::immediate(1),
        });
        let supervisor = InstanceSupervisor::new(
            WorkloadKind::Source,
            KEY.to_string(),
            store.clone(),
            launcher.clone(),
            nodes,
            options,
        );
        Harness {
            store,
            launcher,
            supervisor,
        }
    }

    fn desired(instances: u32, generation: u64) -> DesiredState {
        DesiredState {
            instances,
            generation,
            package: PackageHandle {
                location: "builtin://datagen".to_string(),
                digest: String::new(),
                size_bytes: 0,
            },
            config: ConnectorConfig {
                parallelism: instances,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn ensure_starts_desired_instances() {
        let h = harness();
        let report = h.supervisor.ensure_instances(desired(3, 1)).await.unwrap();
        assert_eq!(report.started, vec![0, 1, 2]);
        assert!(report.is_clean());

        let status = h.supervisor.aggregate_status().await.unwrap();
        assert_eq!(status.num_instances, 3);
        assert_eq!(status.num_running, 3);
        assert!(status.healthy);
        assert_eq!(h.launcher.running().await.len(), 3);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        let report = h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(h.launcher.running().await.len(), 2);
    }

    #[tokio::test]
    async fn scale_down_removes_excess_instances() {
        let h = harness();
        h.supervisor.ensure_instances(desired(3, 1)).await.unwrap();
        let report = h.supervisor.ensure_instances(desired(1, 2)).await.unwrap();

        assert_eq!(report.stopped, vec![0, 1, 2]);
        assert_eq!(report.started, vec![0]);
        assert_eq!(h.store.list_instances(KEY).unwrap().len(), 1);
        let running = h.launcher.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].generation, 2);
    }

    #[tokio::test]
    async fn new_generation_replaces_every_instance() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        h.supervisor.ensure_instances(desired(3, 2)).await.unwrap();

        let running = h.launcher.running().await;
        assert_eq!(running.len(), 3);
        assert!(running.iter().all(|s| s.generation == 2));
        for inst in h.store.list_instances(KEY).unwrap() {
            assert_eq!(inst.generation, 2);
            assert_eq!(inst.status, InstanceStatus::Running);
        }
    }

    #[tokio::test]
    async fn older_generation_is_ignored() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 5)).await.unwrap();
        let report = h.supervisor.ensure_instances(desired(4, 4)).await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(h.supervisor.desired().await.unwrap().generation, 5);
        assert_eq!(h.launcher.running().await.len(), 2);
    }

    #[tokio::test]
    async fn launch_failure_marks_only_that_instance() {
        let h = harness();
        h.launcher.fail_next_launches(1);
        let report = h.supervisor.ensure_instances(desired(3, 1)).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.started.len(), 2);

        let status = h.supervisor.aggregate_status().await.unwrap();
        assert!(!status.healthy);
        let failed = &status.instances[report.failed[0] as usize];
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert!(failed.last_error.as_deref().unwrap().contains("injected"));

        // The next pass retries the failed instance.
        let report = h.supervisor.ensure_instances(desired(3, 1)).await.unwrap();
        assert_eq!(report.started.len(), 1);
        assert!(h.supervisor.aggregate_status().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn retries_absorb_transient_launch_failures() {
        let store = StateStore::open_in_memory().unwrap();
        let launcher = Arc::new(LocalLauncher::new(vec!["local".to_string()]));
        let supervisor = InstanceSupervisor::new(
            WorkloadKind::Sink,
            "sink/t/n/k".to_string(),
            store,
            launcher.clone(),
            Arc::new(NodePool::new(vec!["local".to_string()]).unwrap()),
            Arc::new(SupervisorOptions {
                start_retry: RetryPolicy::immediate(3),
                stop_retry: RetryPolicy::immediate(1),
            }),
        );
        launcher.fail_next_launches(2);
        let report = supervisor.ensure_instances(desired(1, 1)).await.unwrap();
        assert_eq!(report.started, vec![0]);
    }

    #[tokio::test]
    async fn stale_instance_that_cannot_stop_is_not_replaced() {
        let h = harness();
        h.supervisor.ensure_instances(desired(1, 1)).await.unwrap();
        h.launcher.fail_next_terminates(1);

        let report = h.supervisor.ensure_instances(desired(1, 2)).await.unwrap();
        assert_eq!(report.failed, vec![0]);
        assert!(report.started.is_empty());
        let running = h.launcher.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].generation, 1);

        // Next pass stops the old worker and starts the new generation.
        let report = h.supervisor.ensure_instances(desired(1, 2)).await.unwrap();
        assert_eq!(report.started, vec![0]);
        assert_eq!(h.launcher.running().await[0].generation, 2);
    }

    #[tokio::test]
    async fn generations_never_run_side_by_side() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        h.launcher.fail_next_terminates(1);

        let report = h.supervisor.ensure_instances(desired(2, 2)).await.unwrap();
        assert_eq!(report.failed, vec![0]);
        assert_eq!(report.stopped, vec![1]);
        assert!(report.started.is_empty());
        let running = h.launcher.running().await;
        assert!(running.iter().all(|s| s.generation == 1));
        assert_eq!(running.len(), 1);

        let report = h.supervisor.ensure_instances(desired(2, 2)).await.unwrap();
        assert_eq!(report.started, vec![0, 1]);
        let generations: Vec<(u32, u64)> = h
            .launcher
            .running()
            .await
            .iter()
            .map(|s| (s.instance_id, s.generation))
            .collect();
        assert_eq!(generations, vec![(0, 2), (1, 2)]);
    }

    #[tokio::test]
    async fn instance_status_checks_range() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();

        let inst = h.supervisor.instance_status(1).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        assert!(matches!(
            h.supervisor.instance_status(2).await,
            Err(SupervisorError::InstanceNotFound { instance_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn status_before_configuration_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.supervisor.aggregate_status().await,
            Err(SupervisorError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn stop_keeps_records_and_survives_reconcile() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        let report = h.supervisor.stop_all().await.unwrap();
        assert_eq!(report.stopped, vec![0, 1]);
        assert!(h.launcher.running().await.is_empty());

        let records = h.store.list_instances(KEY).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == InstanceStatus::Stopped));

        // Same generation: stopped instances stay stopped.
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        assert!(h.launcher.running().await.is_empty());
        assert!(!h.supervisor.aggregate_status().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn restart_from_stopped_runs_again() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        h.supervisor.stop_instance(1).await.unwrap();
        assert_eq!(
            h.supervisor.instance_status(1).await.unwrap().status,
            InstanceStatus::Stopped
        );

        let report = h.supervisor.restart_instance(1).await.unwrap();
        assert_eq!(report.started, vec![1]);
        let inst = h.supervisor.instance_status(1).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.restart_count, 1);
        assert!(h.supervisor.aggregate_status().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn restart_all_replaces_workers() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        let before: Vec<_> = h
            .store
            .list_instances(KEY)
            .unwrap()
            .into_iter()
            .map(|r| r.worker)
            .collect();

        let report = h.supervisor.restart_all().await.unwrap();
        assert_eq!(report.started, vec![0, 1]);
        let after: Vec<_> = h
            .store
            .list_instances(KEY)
            .unwrap()
            .into_iter()
            .map(|r| r.worker)
            .collect();
        assert_ne!(before, after);
        assert_eq!(h.launcher.running().await.len(), 2);
    }

    #[tokio::test]
    async fn teardown_removes_everything() {
        let h = harness();
        h.supervisor.ensure_instances(desired(3, 1)).await.unwrap();
        let report = h.supervisor.teardown().await.unwrap();
        assert_eq!(report.stopped, vec![0, 1, 2]);
        assert!(h.store.list_instances(KEY).unwrap().is_empty());
        assert!(h.launcher.running().await.is_empty());
    }

    #[tokio::test]
    async fn teardown_failure_is_reported_and_retryable() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        h.launcher.fail_next_terminates(1);

        let err = h.supervisor.teardown().await.unwrap_err();
        match err {
            SupervisorError::TeardownIncomplete { failed, .. } => assert_eq!(failed.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        let left = h.store.list_instances(KEY).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, InstanceStatus::Failed);

        h.supervisor.teardown().await.unwrap();
        assert!(h.store.list_instances(KEY).unwrap().is_empty());
        assert!(h.launcher.running().await.is_empty());
    }

    #[tokio::test]
    async fn nothing_launches_after_teardown() {
        let h = harness();
        h.supervisor.ensure_instances(desired(1, 1)).await.unwrap();
        h.supervisor.teardown().await.unwrap();
        assert!(h.supervisor.is_retired());

        let report = h.supervisor.ensure_instances(desired(2, 2)).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert!(h.launcher.running().await.is_empty());
    }

    #[tokio::test]
    async fn liveness_relaunches_dead_worker() {
        let h = harness();
        h.supervisor.ensure_instances(desired(2, 1)).await.unwrap();
        let victim = h.store.get_instance(KEY, 0).unwrap().unwrap();
        let worker = victim.worker.clone().unwrap();
        assert!(h.launcher.kill(&worker).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = h.supervisor.check_liveness().await.unwrap();
        assert_eq!(report.started, vec![0]);

        let healed = h.store.get_instance(KEY, 0).unwrap().unwrap();
        assert_eq!(healed.status, InstanceStatus::Running);
        assert_eq!(healed.restart_count, 1);
        assert_ne!(healed.worker.as_deref(), Some(worker.as_str()));
        assert!(h.supervisor.aggregate_status().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn liveness_marks_failed_when_relaunch_fails() {
        let h = harness();
        h.supervisor.ensure_instances(desired(1, 1)).await.unwrap();
        let worker = h.store.get_instance(KEY, 0).unwrap().unwrap().worker.unwrap();
        h.launcher.kill(&worker).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.launcher.fail_next_launches(1);

        let report = h.supervisor.check_liveness().await.unwrap();
        assert_eq!(report.failed, vec![0]);
        let inst = h.supervisor.instance_status(0).await.unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn liveness_refreshes_heartbeat_of_live_workers() {
        let h = harness();
        h.supervisor.ensure_instances(desired(1, 1)).await.unwrap();
        let report = h.supervisor.check_liveness().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        let inst = h.supervisor.instance_status(0).await.unwrap();
        assert!(inst.last_heartbeat.is_some());
        assert_eq!(inst.status, InstanceStatus::Running);
    }
}
