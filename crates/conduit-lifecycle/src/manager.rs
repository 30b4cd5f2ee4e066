//! LifecycleManager: the connector control plane for one workload kind.
//!
//! The manager owns the connector records of its kind and one
//! `InstanceSupervisor` per connector. Mutations follow one pattern:
//!
//! 1. validate the request without touching state
//! 2. persist the new desired state under the connector's identity lock
//! 3. hand actuation to a spawned task and wait for it at most
//!    `operation_timeout`
//!
//! When the wait times out the caller gets `Timeout` and the task keeps
//! going; its outcome lands on the record (`state`, `last_error`) where
//! the next query picks it up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use conduit_core::{
    ConnectorCatalog, ConnectorConfig, ConnectorDefinition, ConnectorId, DaemonSettings,
    PackageInput, SettingsError, WorkloadKind, namespace_prefix, validate_segment,
};
use conduit_state::*;
use conduit_supervisor::{
    AggregateStatus, DesiredState, InstanceSupervisor, NodePool, ReconcileReport, RetryPolicy,
    SupervisorOptions, WorkerLauncher,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::locks::KeyedLocks;
use crate::package::{PackageResolver, ResolvedPackage};
use crate::transitions::transition;

/// Tunables for a lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// How long a caller waits for actuation before getting `Timeout`.
    pub operation_timeout: Duration,
    pub max_parallelism: u32,
    pub max_package_bytes: u64,
    pub supervisor: SupervisorOptions,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            max_parallelism: 64,
            max_package_bytes: 256 * 1024 * 1024,
            supervisor: SupervisorOptions::default(),
        }
    }
}

impl LifecycleOptions {
    pub fn from_settings(settings: &DaemonSettings) -> Result<Self, SettingsError> {
        let initial_backoff = settings.initial_backoff()?;
        let max_backoff = settings.max_backoff()?;
        Ok(Self {
            operation_timeout: settings.operation_timeout()?,
            max_parallelism: settings.lifecycle.max_parallelism,
            max_package_bytes: settings.lifecycle.max_package_bytes,
            supervisor: SupervisorOptions {
                start_retry: RetryPolicy {
                    max_attempts: settings.supervisor.start_attempts,
                    initial_backoff,
                    max_backoff,
                },
                stop_retry: RetryPolicy {
                    max_attempts: settings.supervisor.teardown_attempts,
                    initial_backoff,
                    max_backoff,
                },
            },
        })
    }
}

/// Manages every connector of one `WorkloadKind`.
pub struct LifecycleManager {
    kind: WorkloadKind,
    store: StateStore,
    catalog: Arc<ConnectorCatalog>,
    resolver: PackageResolver,
    launcher: Arc<dyn WorkerLauncher>,
    nodes: Arc<NodePool>,
    options: LifecycleOptions,
    supervisor_options: Arc<SupervisorOptions>,
    /// Active supervisors: connector key → supervisor.
    supervisors: RwLock<HashMap<String, Arc<InstanceSupervisor>>>,
    locks: KeyedLocks,
}

impl LifecycleManager {
    pub fn new(
        kind: WorkloadKind,
        store: StateStore,
        catalog: Arc<ConnectorCatalog>,
        launcher: Arc<dyn WorkerLauncher>,
        nodes: Arc<NodePool>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            kind,
            resolver: PackageResolver::new(
                catalog.clone(),
                options.operation_timeout,
                options.max_package_bytes,
            ),
            store,
            catalog,
            launcher,
            nodes,
            supervisor_options: Arc::new(options.supervisor.clone()),
            options,
            supervisors: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Register a new connector and start its instances.
    ///
    /// Placement failures do not fail the call; they leave the record
    /// `failed` with `last_error` set.
    pub async fn register(
        self: &Arc<Self>,
        id: &ConnectorId,
        package: PackageInput,
        config: serde_json::Value,
    ) -> LifecycleResult<()> {
        id.validate()?;
        let key = id.key(self.kind);
        let mut config = ConnectorConfig::from_value(config)?;
        let resolved = self.resolver.resolve(self.kind, &key, package).await?;
        self.validate_config(&mut config, &resolved.handle, resolved.definition.as_ref())?;

        let desired = {
            let _guard = self.locks.lock(&key).await;
            let now = epoch_secs();
            let record = ConnectorRecord {
                kind: self.kind,
                id: id.clone(),
                package: resolved.handle.clone(),
                config,
                state: ConnectorState::Starting,
                generation: 1,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            self.store.create_connector(&record)?;
            if let Err(e) = self.store_package(&key, &resolved) {
                self.store.purge_connector(&key)?;
                return Err(e);
            }
            info!(kind = %self.kind, connector = %id, package = %record.package.location, "registered connector");
            DesiredState::from_record(&record)
        };

        let manager = self.clone();
        self.run_bounded(format!("registering {} {id}", self.kind), async move {
            manager.actuate(key, desired).await.map(|_| ())
        })
        .await
    }

    /// Replace a connector's package and/or config, then replace all of
    /// its instances.
    pub async fn update(
        self: &Arc<Self>,
        id: &ConnectorId,
        package: Option<PackageInput>,
        config: Option<serde_json::Value>,
    ) -> LifecycleResult<()> {
        id.validate()?;
        if package.is_none() && config.is_none() {
            return Err(LifecycleError::InvalidRequest(
                "update contains no new package or config".to_string(),
            ));
        }
        let key = id.key(self.kind);
        let new_config = config.map(ConnectorConfig::from_value).transpose()?;
        let resolved = match package {
            Some(input) => Some(self.resolver.resolve(self.kind, &key, input).await?),
            None => None,
        };

        let desired = {
            let _guard = self.locks.lock(&key).await;
            let mut record = self.live_record(id, &key)?;

            let mut config = match new_config {
                Some(c) => {
                    c.validate_update(&record.config)?;
                    c
                }
                None => record.config.clone(),
            };
            let handle = resolved
                .as_ref()
                .map(|r| r.handle.clone())
                .unwrap_or_else(|| record.package.clone());
            let definition = match &resolved {
                Some(r) => r.definition.clone(),
                None => self.resolver.definition_for(self.kind, &handle)?.cloned(),
            };
            self.validate_config(&mut config, &handle, definition.as_ref())?;

            transition(&mut record, ConnectorState::Updating)?;
            record.generation += 1;
            record.config = config;
            record.package = handle;
            record.last_error = None;
            if let Some(resolved) = &resolved {
                self.store_package(&key, resolved)?;
            }
            self.store.put_connector(&record)?;
            info!(kind = %self.kind, connector = %id, generation = record.generation, "updated connector");
            DesiredState::from_record(&record)
        };

        let manager = self.clone();
        self.run_bounded(format!("updating {} {id}", self.kind), async move {
            manager.actuate(key, desired).await.map(|_| ())
        })
        .await
    }

    /// Tear down a connector and delete it.
    ///
    /// The record is marked `deleting` first. If teardown cannot finish the
    /// record stays there with `last_error` and a retry resumes cleanup.
    pub async fn deregister(self: &Arc<Self>, id: &ConnectorId) -> LifecycleResult<()> {
        id.validate()?;
        let key = id.key(self.kind);
        {
            let _guard = self.locks.lock(&key).await;
            let mut record = self
                .store
                .get_connector(&key)?
                .ok_or_else(|| self.not_found(id))?;
            if record.state != ConnectorState::Deleting {
                transition(&mut record, ConnectorState::Deleting)?;
                self.store.put_connector(&record)?;
            }
        }

        let manager = self.clone();
        self.run_bounded(format!("deregistering {} {id}", self.kind), async move {
            manager.finish_deletion(key).await
        })
        .await
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn get_info(&self, id: &ConnectorId) -> LifecycleResult<ConnectorRecord> {
        id.validate()?;
        self.store
            .get_connector(&id.key(self.kind))?
            .ok_or_else(|| self.not_found(id))
    }

    /// Connector names in a namespace, sorted.
    pub async fn list(&self, tenant: &str, namespace: &str) -> LifecycleResult<Vec<String>> {
        validate_segment("tenant", tenant)?;
        validate_segment("namespace", namespace)?;
        let prefix = namespace_prefix(self.kind, tenant, namespace);
        let mut names: Vec<String> = self
            .store
            .list_connectors(&prefix)?
            .into_iter()
            .map(|r| r.id.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Builtin connectors usable as this manager's kind.
    pub fn builtin_connectors(&self) -> Vec<ConnectorDefinition> {
        self.catalog.for_kind(self.kind)
    }

    pub async fn instance_status(
        &self,
        id: &ConnectorId,
        instance_id: u32,
    ) -> LifecycleResult<InstanceRecord> {
        let supervisor = self.supervisor_for_query(id).await?;
        Ok(supervisor.instance_status(instance_id).await?)
    }

    pub async fn aggregate_status(&self, id: &ConnectorId) -> LifecycleResult<AggregateStatus> {
        let supervisor = self.supervisor_for_query(id).await?;
        Ok(supervisor.aggregate_status().await?)
    }

    // ── Instance control ───────────────────────────────────────────

    pub async fn restart_instance(
        self: &Arc<Self>,
        id: &ConnectorId,
        instance_id: u32,
    ) -> LifecycleResult<()> {
        let supervisor = self.supervisor_for_query(id).await?;
        let manager = self.clone();
        let key = id.key(self.kind);
        self.run_bounded(format!("restarting {id} instance {instance_id}"), async move {
            let report = supervisor.restart_instance(instance_id).await?;
            manager.settle_health(&key).await?;
            check_report("restart", &report)
        })
        .await
    }

    pub async fn restart_all(self: &Arc<Self>, id: &ConnectorId) -> LifecycleResult<()> {
        let supervisor = self.supervisor_for_query(id).await?;
        let manager = self.clone();
        let key = id.key(self.kind);
        self.run_bounded(format!("restarting {id}"), async move {
            let report = supervisor.restart_all().await?;
            manager.settle_health(&key).await?;
            check_report("restart", &report)
        })
        .await
    }

    pub async fn stop_instance(
        self: &Arc<Self>,
        id: &ConnectorId,
        instance_id: u32,
    ) -> LifecycleResult<()> {
        let supervisor = self.supervisor_for_query(id).await?;
        self.run_bounded(format!("stopping {id} instance {instance_id}"), async move {
            let report = supervisor.stop_instance(instance_id).await?;
            check_report("stop", &report)
        })
        .await
    }

    pub async fn stop_all(self: &Arc<Self>, id: &ConnectorId) -> LifecycleResult<()> {
        let supervisor = self.supervisor_for_query(id).await?;
        self.run_bounded(format!("stopping {id}"), async move {
            let report = supervisor.stop_all().await?;
            check_report("stop", &report)
        })
        .await
    }

    // ── Background ─────────────────────────────────────────────────

    /// Resume every persisted connector of this kind after a restart.
    ///
    /// `deleting` records finish their deletion; everything else is
    /// reconciled. Returns the number of connectors resumed.
    pub async fn recover(self: &Arc<Self>) -> LifecycleResult<usize> {
        let records = self.store.list_connectors(&format!("{}/", self.kind.as_str()))?;
        let count = records.len();
        let mut tasks = JoinSet::new();
        for record in records {
            let manager = self.clone();
            let key = record.table_key();
            if record.state == ConnectorState::Deleting {
                tasks.spawn(async move { (key.clone(), manager.finish_deletion(key).await) });
            } else {
                let desired = DesiredState::from_record(&record);
                tasks.spawn(async move {
                    (key.clone(), manager.actuate(key, desired).await.map(|_| ()))
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Err(e))) => warn!(%key, error = %e, "recovery incomplete"),
                Ok((key, Ok(()))) => debug!(%key, "recovered connector"),
                Err(e) => warn!(error = %e, "recovery task panicked"),
            }
        }
        info!(kind = %self.kind, count, "recovered connectors");
        Ok(count)
    }

    /// Run one liveness pass over every supervised connector.
    pub async fn sweep_liveness(&self) -> usize {
        let supervisors: Vec<(String, Arc<InstanceSupervisor>)> = self
            .supervisors
            .read()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        let mut healed = 0;
        for (key, supervisor) in supervisors {
            match supervisor.check_liveness().await {
                Ok(report) => {
                    healed += report.started.len();
                    if !report.started.is_empty() || !report.failed.is_empty() {
                        if let Err(e) = self.settle_health(&key).await {
                            warn!(%key, error = %e, "failed to record liveness outcome");
                        }
                    }
                }
                Err(e) => warn!(%key, error = %e, "liveness check failed"),
            }
        }
        healed
    }

    // ── Internals ──────────────────────────────────────────────────

    fn not_found(&self, id: &ConnectorId) -> LifecycleError {
        LifecycleError::NotFound(format!("{} {id}", self.kind))
    }

    /// Current record, rejecting connectors that are being deleted.
    fn live_record(&self, id: &ConnectorId, key: &str) -> LifecycleResult<ConnectorRecord> {
        let record = self
            .store
            .get_connector(key)?
            .ok_or_else(|| self.not_found(id))?;
        if record.state == ConnectorState::Deleting {
            return Err(LifecycleError::Forbidden(format!(
                "{} {id} is being deleted",
                self.kind
            )));
        }
        Ok(record)
    }

    fn validate_config(
        &self,
        config: &mut ConnectorConfig,
        handle: &PackageHandle,
        definition: Option<&ConnectorDefinition>,
    ) -> LifecycleResult<()> {
        if let Some(def) = definition {
            def.config_schema
                .validate(&config.configs)
                .map_err(|problems| LifecycleError::InvalidConfig(problems.join("; ")))?;
            let blank = config.class_name.as_deref().is_none_or(|c| c.trim().is_empty());
            if blank {
                config.class_name = def.class_for(self.kind).map(str::to_string);
            }
        }
        config.validate(self.kind, handle.is_builtin(), self.options.max_parallelism)?;
        Ok(())
    }

    /// Keep the package store in step with the resolved package.
    fn store_package(&self, key: &str, resolved: &ResolvedPackage) -> LifecycleResult<()> {
        match &resolved.bytes {
            Some(bytes) => self.store.put_package(key, bytes)?,
            None => {
                self.store.delete_package(key)?;
            }
        }
        Ok(())
    }

    fn new_supervisor(&self, key: &str) -> Arc<InstanceSupervisor> {
        Arc::new(InstanceSupervisor::new(
            self.kind,
            key.to_string(),
            self.store.clone(),
            self.launcher.clone(),
            self.nodes.clone(),
            self.supervisor_options.clone(),
        ))
    }

    /// Supervisor for `key`, created on first use. Deletion goes through
    /// here so it can tear down what an earlier process launched.
    async fn supervisor(&self, key: &str) -> Arc<InstanceSupervisor> {
        if let Some(s) = self.supervisors.read().await.get(key) {
            return s.clone();
        }
        let mut supervisors = self.supervisors.write().await;
        supervisors
            .entry(key.to_string())
            .or_insert_with(|| self.new_supervisor(key))
            .clone()
    }

    /// Like `supervisor`, but never creates one for a connector that is
    /// gone or being deleted.
    ///
    /// Deletion purges the record before dropping the map entry, so the
    /// record check under the map's write lock cannot miss a completed
    /// deletion.
    async fn live_supervisor(&self, key: &str) -> LifecycleResult<Option<Arc<InstanceSupervisor>>> {
        if let Some(s) = self.supervisors.read().await.get(key) {
            return Ok(Some(s.clone()));
        }
        let mut supervisors = self.supervisors.write().await;
        if let Some(s) = supervisors.get(key) {
            return Ok(Some(s.clone()));
        }
        match self.store.get_connector(key)? {
            Some(record) if record.state != ConnectorState::Deleting => {}
            _ => return Ok(None),
        }
        let supervisor = self.new_supervisor(key);
        supervisors.insert(key.to_string(), supervisor.clone());
        Ok(Some(supervisor))
    }

    /// Supervisor of a live connector, primed with its desired state.
    async fn supervisor_for_query(
        &self,
        id: &ConnectorId,
    ) -> LifecycleResult<Arc<InstanceSupervisor>> {
        id.validate()?;
        let key = id.key(self.kind);
        let record = self.live_record(id, &key)?;
        let supervisor = self
            .live_supervisor(&key)
            .await?
            .ok_or_else(|| self.not_found(id))?;
        if supervisor.desired().await.is_none() {
            supervisor.set_desired(DesiredState::from_record(&record)).await;
        }
        Ok(supervisor)
    }

    /// Wait for `work` at most `operation_timeout`.
    ///
    /// The work runs in its own task; on timeout the task is detached, not
    /// aborted.
    async fn run_bounded<T, F>(&self, what: String, work: F) -> LifecycleResult<T>
    where
        T: Send + 'static,
        F: Future<Output = LifecycleResult<T>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        match tokio::time::timeout(self.options.operation_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(LifecycleError::Internal(format!("{what} failed: {e}"))),
            Err(_) => {
                warn!(
                    what = %what,
                    timeout = ?self.options.operation_timeout,
                    "operation still in progress, returning timeout"
                );
                Err(LifecycleError::Timeout(what))
            }
        }
    }

    /// Converge instances to `desired` and record the outcome.
    async fn actuate(
        self: Arc<Self>,
        key: String,
        desired: DesiredState,
    ) -> LifecycleResult<ReconcileReport> {
        let Some(supervisor) = self.live_supervisor(&key).await? else {
            debug!(%key, "connector gone before actuation");
            return Ok(ReconcileReport::default());
        };
        let generation = desired.generation;
        let outcome = supervisor.ensure_instances(desired).await;

        let _guard = self.locks.lock(&key).await;
        let Some(mut record) = self.store.get_connector(&key)? else {
            return Ok(outcome.unwrap_or_default());
        };
        if record.generation != generation || record.state == ConnectorState::Deleting {
            debug!(%key, generation, "actuation superseded");
            return Ok(outcome.unwrap_or_default());
        }

        match &outcome {
            Ok(report) if report.is_clean() => {
                transition(&mut record, ConnectorState::Running)?;
                record.last_error = None;
            }
            Ok(report) => {
                transition(&mut record, ConnectorState::Failed)?;
                record.last_error = Some(format!(
                    "instances {:?} failed to start",
                    report.failed
                ));
            }
            Err(e) => {
                transition(&mut record, ConnectorState::Failed)?;
                record.last_error = Some(e.to_string());
            }
        }
        self.store.put_connector(&record)?;
        info!(%key, generation, state = record.state.as_str(), "actuation finished");
        Ok(outcome?)
    }

    /// Tear down every instance, then purge the record and package.
    async fn finish_deletion(self: Arc<Self>, key: String) -> LifecycleResult<()> {
        let supervisor = self.supervisor(&key).await;
        match supervisor.teardown().await {
            Ok(_) => {
                let _guard = self.locks.lock(&key).await;
                self.store.purge_connector(&key)?;
                self.supervisors.write().await.remove(&key);
                info!(%key, "deregistered connector");
                Ok(())
            }
            Err(e) => {
                let _guard = self.locks.lock(&key).await;
                if let Some(mut record) = self.store.get_connector(&key)? {
                    record.last_error = Some(e.to_string());
                    record.updated_at = epoch_secs();
                    self.store.put_connector(&record)?;
                }
                warn!(%key, error = %e, "deregistration incomplete");
                Err(LifecycleError::Internal(e.to_string()))
            }
        }
    }

    /// Derive the connector state from its instances after a restart or a
    /// liveness pass: any failed instance fails the connector, a fully
    /// running connector recovers from `failed`.
    async fn settle_health(&self, key: &str) -> LifecycleResult<()> {
        let _guard = self.locks.lock(key).await;
        let Some(mut record) = self.store.get_connector(key)? else {
            return Ok(());
        };
        if matches!(
            record.state,
            ConnectorState::Deleting | ConnectorState::Updating
        ) {
            return Ok(());
        }
        let Some(supervisor) = self.supervisors.read().await.get(key).cloned() else {
            return Ok(());
        };
        let status = supervisor.aggregate_status().await?;

        let failed: Vec<u32> = status
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Failed)
            .map(|i| i.instance_id)
            .collect();
        if !failed.is_empty() {
            transition(&mut record, ConnectorState::Failed)?;
            record.last_error = Some(format!("instances {failed:?} failed"));
        } else if status.healthy && record.state != ConnectorState::Running {
            transition(&mut record, ConnectorState::Running)?;
            record.last_error = None;
        } else {
            return Ok(());
        }
        self.store.put_connector(&record)?;
        Ok(())
    }
}

fn check_report(action: &str, report: &ReconcileReport) -> LifecycleResult<()> {
    if report.is_clean() {
        Ok(())
    } else {
        Err(LifecycleError::Internal(format!(
            "failed to {action} instances {:?}",
            report.failed
        )))
    }
}
