// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cluster instance lifecycle: fleet creation, the state machine and the
//! start/monitor/destroy operations.
//!
//! Instance state is an atomic word so health monitors can observe it
//! without taking the scheduler's mutex; every other instance field lives
//! behind [`ClusterInstance::inner`].

use super::{events::OperationEvent, imp::ExecutionContext, imp::TestTask};
use crate::{
    config::ClusterGroupConfig,
    errors::{ConfigError, ProviderError, RunError},
    providers::{ClusterHandle, ClusterProvider},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Health monitors probe at this fixed interval.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// One instance never absorbs more tests than this when sizing a fleet.
const MAX_TESTS_PER_INSTANCE: usize = 20;

/// Lifecycle state of one cluster instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub(crate) enum ClusterState {
    Added = 0,
    Ready = 1,
    Busy = 2,
    Starting = 3,
    Stopping = 4,
    Crashed = 5,
    NotAvailable = 6,
    Shutdown = 7,
}

impl ClusterState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Added,
            1 => Self::Ready,
            2 => Self::Busy,
            3 => Self::Starting,
            4 => Self::Stopping,
            5 => Self::Crashed,
            6 => Self::NotAvailable,
            _ => Self::Shutdown,
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
            Self::NotAvailable => "not available",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Atomic wrapper over [`ClusterState`].
pub(crate) struct AtomicClusterState(AtomicU32);

impl AtomicClusterState {
    pub(crate) fn new(state: ClusterState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub(crate) fn load(&self) -> ClusterState {
        ClusterState::from_u32(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, state: ClusterState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }

    /// Stores `new` only when the current state is `old`.
    pub(crate) fn compare_and_swap(&self, old: ClusterState, new: ClusterState) -> bool {
        self.0
            .compare_exchange(old as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One start or destroy operation, kept for the report.
#[derive(Clone, Debug)]
pub(crate) struct OperationRecord {
    pub(crate) time: DateTime<Local>,
    pub(crate) duration: Duration,
    pub(crate) status: ClusterState,
    pub(crate) attempt: u32,
    pub(crate) log_file: Option<Utf8PathBuf>,
    pub(crate) error: Option<String>,
}

/// Mutable instance fields, guarded by the scheduler-wide discipline: short
/// critical sections, never held across an await point.
pub(crate) struct InstanceMut {
    pub(crate) start_count: u32,
    pub(crate) start_time: Instant,
    pub(crate) current_task: String,
    pub(crate) task_cancel: Option<CancellationToken>,
    pub(crate) cancel_monitor: Option<CancellationToken>,
    pub(crate) running_execution: Option<Arc<crate::config::ExecutionConfig>>,
    pub(crate) retest_counter: u32,
    pub(crate) records: Vec<OperationRecord>,
}

/// One provisioned cluster slot.
pub(crate) struct ClusterInstance {
    pub(crate) id: String,
    pub(crate) config: Arc<ClusterGroupConfig>,
    pub(crate) handle: Arc<dyn ClusterHandle>,
    pub(crate) state: AtomicClusterState,
    pub(crate) inner: Mutex<InstanceMut>,
}

impl ClusterInstance {
    fn new(handle: Arc<dyn ClusterHandle>, config: Arc<ClusterGroupConfig>) -> Self {
        Self {
            id: handle.id(),
            config,
            handle,
            state: AtomicClusterState::new(ClusterState::Added),
            inner: Mutex::new(InstanceMut {
                start_count: 0,
                start_time: Instant::now(),
                current_task: String::new(),
                task_cancel: None,
                cancel_monitor: None,
                running_execution: None,
                retest_counter: 0,
                records: Vec::new(),
            }),
        }
    }

    /// True when the instance is shut down, crashed, not available, or in
    /// one of `extra`.
    pub(crate) fn is_down_or(&self, extra: &[ClusterState]) -> bool {
        let state = self.state.load();
        matches!(
            state,
            ClusterState::Shutdown | ClusterState::Crashed | ClusterState::NotAvailable
        ) || extra.contains(&state)
    }

    /// Display state, naming the current task when busy.
    pub(crate) fn display_state(&self) -> String {
        let state = self.state.load();
        if state == ClusterState::Busy {
            format!("running {}", self.inner.lock().current_task)
        } else {
            state.to_string()
        }
    }
}

/// A declared fleet from one provider.
pub(crate) struct ClusterGroup {
    pub(crate) config: Arc<ClusterGroupConfig>,
    pub(crate) provider: Arc<dyn ClusterProvider>,
    pub(crate) instances: Vec<Arc<ClusterInstance>>,
    /// Pending-or-running tasks keyed by test key.
    pub(crate) tasks: Mutex<HashMap<String, Arc<TestTask>>>,
    /// Finished tasks keyed by test key; a multi-cluster task is recorded
    /// only against its first group.
    pub(crate) completed: Mutex<HashMap<String, Arc<TestTask>>>,
}

/// `instances = ceil(min(test_count / tests_per_instance, declared))`, with
/// `tests_per_instance` capped at 20.
pub(crate) fn fleet_size(test_count: usize, declared: usize, tests_per_instance: usize) -> usize {
    let per_instance = tests_per_instance.min(MAX_TESTS_PER_INSTANCE).max(1);
    let wanted = (test_count as f64 / per_instance as f64).min(declared as f64);
    wanted.ceil() as usize
}

impl ExecutionContext {
    /// Creates every enabled cluster group with its sized fleet.
    pub(crate) async fn create_clusters(&mut self) -> Result<(), RunError> {
        let mut groups = Vec::new();
        for group_config in &self.config.providers {
            let (enable, test_count) = self.should_enable_group(group_config);
            if !enable {
                continue;
            }
            info!(
                "initialize provider for config: {} {}",
                group_config.name, group_config.kind
            );
            let provider = self
                .providers
                .get(&group_config.kind)
                .cloned()
                .ok_or_else(|| ConfigError::ProviderNotFound {
                    kind: group_config.kind.clone(),
                })?;

            let count = fleet_size(
                test_count,
                group_config.instances,
                self.config.tests_per_cluster_instance,
            );
            info!(
                "creating {count} instances of '{}' cluster to run {test_count} test(s)",
                group_config.name
            );
            let config = Arc::new(group_config.clone());
            let mut instances = Vec::new();
            for _ in 0..count {
                let handle = provider
                    .create_cluster(&config, Arc::clone(&self.manager), &self.arguments.instance_options)
                    .await
                    .map_err(|error| RunError::CreateCluster {
                        group: config.name.clone(),
                        error,
                    })?;
                instances.push(Arc::new(ClusterInstance::new(handle, Arc::clone(&config))));
            }
            if instances.is_empty() {
                return Err(ConfigError::NoInstances {
                    group: config.name.clone(),
                }
                .into());
            }
            groups.push(Arc::new(ClusterGroup {
                config,
                provider,
                instances,
                tasks: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
            }));
        }
        if groups.is_empty() {
            return Err(ConfigError::NoClusters.into());
        }
        self.clusters = groups;
        Ok(())
    }

    /// Decides whether a group participates and how many tests are relevant
    /// to it: the group must be enabled (in config or by `-c`), pass the
    /// `-k` filter, and have at least one execution with a matching
    /// selector that found tests.
    fn should_enable_group(&self, config: &ClusterGroupConfig) -> (bool, usize) {
        let by_cli = self.arguments.clusters.contains(&config.name);
        if !config.enabled && !by_cli {
            info!("skipping disabled cluster config: {}", config.name);
            return (false, 0);
        }
        if !(self.arguments.clusters.is_empty() || by_cli) {
            info!("disabling cluster config by cluster filter: {}", config.name);
            return (false, 0);
        }
        if !(self.arguments.kinds.is_empty() || self.arguments.kinds.contains(&config.kind)) {
            info!("disabling cluster config by kind filter: {}", config.name);
            return (false, 0);
        }

        let mut test_count = 0;
        for exec in &self.config.executions {
            let might_be_used = exec.cluster_selector.is_empty()
                || exec.cluster_selector.contains(&config.name);
            let found = self.tests_found.get(&exec.name).copied().unwrap_or(0);
            if might_be_used && found > 0 {
                test_count += found;
            }
        }
        if test_count == 0 {
            info!("no tests found for cluster config '{}', skipping", config.name);
            return (false, 0);
        }
        (true, test_count)
    }

    /// Pre-run cleanup of leaked clusters, one pass per enabled group.
    pub(crate) fn spawn_cleanup(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            for group in &ctx.clusters {
                group
                    .provider
                    .cleanup_clusters(
                        &group.config,
                        Arc::clone(&ctx.manager),
                        &ctx.arguments.instance_options,
                    )
                    .await;
            }
        });
    }

    /// Admission rule for starting an instance. Returns true when the
    /// caller may treat the cluster as live or on its way to readiness.
    pub(crate) fn start_cluster(self: &Arc<Self>, ci: &Arc<ClusterInstance>) -> bool {
        let state = ci.state.load();
        if state != ClusterState::Added && state != ClusterState::Crashed {
            // Already live or on its way; nothing to start.
            return true;
        }

        let attempt = {
            let mut inner = ci.inner.lock();
            if inner.start_count > ci.config.retry_count {
                info!(
                    "marking cluster {} as not available, (re)starts: {}",
                    ci.id, ci.config.retry_count
                );
                ci.state.store(ClusterState::NotAvailable);
                return false;
            }
            ci.state.store(ClusterState::Starting);
            inner.start_count += 1;
            inner.start_count
        };

        let ctx = Arc::clone(self);
        let ci = Arc::clone(ci);
        tokio::spawn(async move {
            ctx.run_cluster_starter(ci, attempt).await;
        });
        true
    }

    async fn run_cluster_starter(self: &Arc<Self>, ci: Arc<ClusterInstance>, attempt: u32) {
        let timeout = ci.config.cluster_timeout();
        let started = Local::now();
        let sw = Instant::now();
        let mut record = OperationRecord {
            time: started,
            duration: Duration::ZERO,
            status: ClusterState::Starting,
            attempt,
            log_file: None,
            error: None,
        };

        match ci.handle.start(timeout).await {
            Ok(log_file) => {
                record.status = ClusterState::Ready;
                record.log_file = Some(log_file);
                record.duration = sw.elapsed();
                ci.inner.lock().records.push(record);

                if ci.state.load() != ClusterState::Crashed {
                    let monitor = CancellationToken::new();
                    ci.inner.lock().cancel_monitor = Some(monitor.clone());
                    self.monitor_cluster(monitor, ci).await;
                } else {
                    self.send_cluster_update(&ci).await;
                }
            }
            Err(failure) => {
                record.status = ClusterState::Crashed;
                record.log_file = failure.log_file;
                record.error = Some(failure.error.to_string());
                ci.state.store(ClusterState::Stopping);
                if self.destroy_cluster(&ci, false, false).await.is_err() {
                    error!(
                        "both start and destroy of cluster returned errors, \
                         stop retrying operations with this cluster {}",
                        ci.id
                    );
                    ci.inner.lock().start_count = ci.config.retry_count + 1;
                    ci.state.store(ClusterState::NotAvailable);
                    record.status = ClusterState::NotAvailable;
                }
                record.duration = sw.elapsed();
                ci.inner.lock().records.push(record);
                self.send_cluster_update(&ci).await;
            }
        }
    }

    /// Periodic liveness loop. The first successful check moves the
    /// instance to ready; any later failure destroys it.
    async fn monitor_cluster(self: &Arc<Self>, cancel: CancellationToken, ci: Arc<ClusterInstance>) {
        let mut checks = 0u32;
        loop {
            if let Err(err) = ci.handle.check_alive().await {
                error!("failed to interact with {}: {err}", ci.id);
                let _ = self.destroy_cluster(&ci, true, false).await;
                break;
            }

            if checks == 0 {
                // Initial check performed, the cluster becomes ready.
                ci.state.store(ClusterState::Ready);
                ci.inner.lock().start_time = Instant::now();
                self.send_cluster_update(&ci).await;
                info!("cluster instance started: {}", ci.id);
            }
            checks += 1;
            tokio::select! {
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    info!(
                        "cluster monitoring is canceled: {}. Uptime: {} seconds",
                        ci.id,
                        checks * MONITOR_INTERVAL.as_secs() as u32
                    );
                    return;
                }
            }
        }
    }

    /// Destroys an instance. A no-op when the cluster is already down or
    /// still starting. `fork` runs the provider call in the background
    /// under the shutdown wait-group.
    pub(crate) async fn destroy_cluster(
        &self,
        ci: &Arc<ClusterInstance>,
        send_update: bool,
        fork: bool,
    ) -> Result<(), ProviderError> {
        if ci.is_down_or(&[ClusterState::Starting]) {
            // Already destroyed or not available.
            return Ok(());
        }
        ci.state.store(ClusterState::Stopping);

        if let Some(monitor) = &ci.inner.lock().cancel_monitor {
            monitor.cancel();
        }

        let timeout = ci.config.cluster_timeout();
        if fork {
            let handle = Arc::clone(&ci.handle);
            self.tracker.spawn(async move {
                if let Err(err) = handle.destroy(timeout).await {
                    error!("failed to destroy cluster: {err}");
                }
            });
            return Ok(());
        }

        let result = ci.handle.destroy(timeout).await;
        if let Err(err) = &result {
            error!("failed to destroy cluster: {err}");
        }

        if ci.config.stop_delay != 0 {
            info!("cluster stop warm-up timeout specified {}", ci.config.stop_delay);
            tokio::time::sleep(Duration::from_secs(ci.config.stop_delay)).await;
        }
        ci.state.store(ClusterState::Crashed);
        if send_update {
            self.send_cluster_update(ci).await;
        }
        result
    }

    pub(crate) async fn send_cluster_update(&self, ci: &Arc<ClusterInstance>) {
        let _ = self
            .op_tx
            .send(OperationEvent::ClusterUpdate(Arc::clone(ci)))
            .await;
    }

    /// Shuts down every non-busy instance of groups that have no tasks
    /// left. Instances that are still starting are left alone so in-flight
    /// provisioning is not cancelled.
    pub(crate) async fn check_clusters_usage(&self) {
        for group in &self.clusters {
            if !group.tasks.lock().is_empty() {
                continue;
            }
            let up = group
                .instances
                .iter()
                .filter(|ci| !ci.is_down_or(&[]))
                .count();
            if up == 0 {
                continue;
            }
            info!(
                "all tasks for cluster group {} are complete, starting cluster shutdown",
                group.config.name
            );
            for ci in &group.instances {
                if ci.is_down_or(&[ClusterState::Busy, ClusterState::Starting]) {
                    continue;
                }
                let _ = self.destroy_cluster(ci, false, true).await;
                ci.state.store(ClusterState::Shutdown);
            }
        }
    }

    /// Destroys every instance at the end of the run, in parallel, unless
    /// `--noStop` was given. Cancels any task still holding an instance.
    pub(crate) async fn perform_shutdown(self: &Arc<Self>) {
        if !self.arguments.instance_options.no_stop {
            for group in &self.clusters {
                for ci in &group.instances {
                    if let Some(cancel) = &ci.inner.lock().task_cancel {
                        info!("canceling currently running task");
                        cancel.cancel();
                    }
                    info!("schedule closing cluster {} {}", group.config.name, ci.id);
                    let ctx = Arc::clone(self);
                    let ci = Arc::clone(ci);
                    self.tracker.spawn(async move {
                        info!("closing cluster {} {}", ci.config.name, ci.id);
                        let _ = ctx.destroy_cluster(&ci, false, false).await;
                    });
                }
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("all clusters destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_size_caps_and_rounds_up() {
        // 10 tests over 4-per-instance wants 2.5 instances, capped by the
        // declared maximum.
        assert_eq!(fleet_size(10, 3, 4), 3);
        assert_eq!(fleet_size(10, 5, 4), 3);
        assert_eq!(fleet_size(1, 5, 4), 1);
        assert_eq!(fleet_size(100, 2, 50), 2);
        // Zero declared instances disables the group entirely.
        assert_eq!(fleet_size(10, 0, 4), 0);
    }

    #[test]
    fn atomic_state_round_trips() {
        let state = AtomicClusterState::new(ClusterState::Added);
        assert_eq!(state.load(), ClusterState::Added);
        state.store(ClusterState::Starting);
        assert_eq!(state.load(), ClusterState::Starting);
        assert!(state.compare_and_swap(ClusterState::Starting, ClusterState::Ready));
        assert!(!state.compare_and_swap(ClusterState::Starting, ClusterState::Busy));
        assert_eq!(state.load(), ClusterState::Ready);
    }
}
