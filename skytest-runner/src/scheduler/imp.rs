// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The execution context and the single-threaded scheduler loop.

use super::{
    cluster::{ClusterGroup, ClusterInstance, ClusterState},
    events::OperationEvent,
};
use crate::{
    config::RunConfig,
    errors::RunError,
    exec_manager::ExecutionManager,
    health,
    model::{collect_tests, SuiteInfo, TestEntry, TestStatus},
    providers::{InstanceOptions, ProviderRegistry},
    reporter::Report,
    signal::{self, SignalMode},
    time::RunClock,
};
use parking_lot::Mutex;
use regex::Regex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Bounded so supervisors are decoupled from the main loop.
const OPERATION_CHANNEL_CAPACITY: usize = 100;

/// Command line arguments that shape a run.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    /// Enable only the named cluster groups.
    pub clusters: Vec<String>,
    /// Enable only the named provider kinds.
    pub kinds: Vec<String>,
    /// Run only tests carrying these tags.
    pub tags: Vec<String>,
    /// Cap on the number of source tests queued.
    pub count: Option<usize>,
    /// Allow-list of test names.
    pub only_run: Vec<String>,
    /// Instance operation flags.
    pub instance_options: InstanceOptions,
}

/// The result of a finished run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The aggregated report; also written to the configured report file.
    pub report: Report,
    /// Total failures in the report (test and cluster failures).
    pub failures: usize,
    /// The fatal condition that ended the loop early, if any.
    pub fatal: Option<RunError>,
}

impl RunOutcome {
    /// True when the run passed: no failures and no fatal condition.
    pub fn success(&self) -> bool {
        self.failures == 0 && self.fatal.is_none()
    }
}

/// A scheduled binding of a test entry to one or more cluster groups.
pub(crate) struct TestTask {
    pub(crate) task_id: u64,
    pub(crate) test: Mutex<TestEntry>,
    pub(crate) clusters: Mutex<Vec<Arc<ClusterGroup>>>,
    pub(crate) binding: Mutex<TaskBinding>,
}

/// The task's concrete binding, re-derived from instance IDs at dispatch.
pub(crate) struct TaskBinding {
    pub(crate) cluster_task_id: String,
    pub(crate) instances: Vec<Arc<ClusterInstance>>,
}

/// Scheduler-owned collections. One mutex guards them all; critical
/// sections are short and never span an await point.
#[derive(Default)]
pub(crate) struct SchedState {
    pub(crate) pending: Vec<Arc<TestTask>>,
    pub(crate) running: HashMap<u64, Arc<TestTask>>,
    pub(crate) completed: Vec<Arc<TestTask>>,
    pub(crate) skipped: Vec<Arc<TestTask>>,
    pub(crate) failed_count: u32,
    pub(crate) clock: Option<RunClock>,
}

/// Shared state of one run.
pub(crate) struct ExecutionContext {
    pub(crate) config: RunConfig,
    pub(crate) arguments: Arguments,
    pub(crate) manager: Arc<dyn ExecutionManager>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) tests_found: HashMap<String, usize>,
    pub(crate) restart_patterns: Vec<Regex>,
    pub(crate) clusters: Vec<Arc<ClusterGroup>>,
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) op_tx: mpsc::Sender<OperationEvent>,
    op_rx: Mutex<Option<mpsc::Receiver<OperationEvent>>>,
    pub(crate) term_tx: mpsc::Sender<RunError>,
    term_rx: Mutex<Option<mpsc::Receiver<RunError>>>,
    pub(crate) tracker: TaskTracker,
}

/// Runs the whole suite: collects tests, provisions fleets, schedules every
/// task, aggregates the report and shuts the fleets down.
pub async fn perform_testing(
    mut config: RunConfig,
    arguments: Arguments,
    providers: ProviderRegistry,
    manager: Arc<dyn ExecutionManager>,
    signals: SignalMode,
) -> Result<RunOutcome, RunError> {
    let only_run = if arguments.only_run.is_empty() {
        config.only_run.clone()
    } else {
        arguments.only_run.clone()
    };
    config.impose_only_run(&only_run);
    config.impose_tags(&arguments.tags);

    let (tests, tests_found) = collect_tests(&config)?;
    let restart_patterns = config.retest_config.compiled_patterns()?;

    let (op_tx, op_rx) = mpsc::channel(OPERATION_CHANNEL_CAPACITY);
    let term_capacity = config.health_check.len().max(10);
    let (term_tx, term_rx) = mpsc::channel(term_capacity);

    let mut ctx = ExecutionContext {
        config,
        arguments,
        manager,
        providers,
        tests_found,
        restart_patterns,
        clusters: Vec::new(),
        sched: Mutex::new(SchedState::default()),
        op_tx,
        op_rx: Mutex::new(Some(op_rx)),
        term_tx,
        term_rx: Mutex::new(Some(term_rx)),
        tracker: TaskTracker::new(),
    };
    ctx.create_clusters().await?;
    let ctx = Arc::new(ctx);
    ctx.spawn_cleanup();
    ctx.create_tasks(tests);

    signal::spawn_signal_watchers(signals, ctx.term_tx.clone())
        .map_err(|error| RunError::SignalSetup { error })?;

    let exec_result = ctx.perform_execution().await;
    let report_result = ctx.generate_report();
    ctx.perform_shutdown().await;

    match report_result {
        Ok((report, failures)) => Ok(RunOutcome {
            report,
            failures,
            fatal: exec_result.err(),
        }),
        Err(report_error) => {
            error!("error during generation of report: {report_error}");
            Ok(RunOutcome {
                report: Report::new(),
                failures: 0,
                fatal: exec_result.err().or(Some(RunError::Report(report_error))),
            })
        }
    }
}

impl ExecutionContext {
    async fn perform_execution(self: &Arc<Self>) -> Result<(), RunError> {
        info!("starting test execution");
        self.sched.lock().clock = Some(RunClock::start());

        let deadline = self
            .config
            .global_timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let stats_period = if self.config.statistics.enabled && self.config.statistics.interval > 0 {
            Duration::from_secs(self.config.statistics.interval)
        } else {
            Duration::from_secs(60)
        };
        let mut stats_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + stats_period, stats_period);

        health::start_health_checks(self);

        let mut op_rx = self
            .op_rx
            .lock()
            .take()
            .expect("the execution loop runs once per context");
        let mut term_rx = self
            .term_rx
            .lock()
            .take()
            .expect("the execution loop runs once per context");

        let result = loop {
            self.assign_tasks().await;
            self.check_clusters_usage().await;

            let no_tasks = {
                let sched = self.sched.lock();
                sched.pending.is_empty() && sched.running.is_empty()
            };
            if no_tasks {
                break Ok(());
            }

            if let Err(err) = self
                .poll_events(&mut op_rx, &mut term_rx, deadline, &mut stats_ticker)
                .await
            {
                break Err(err);
            }
        };

        if self.config.statistics.enabled {
            self.print_statistics();
        }
        if result.is_ok() {
            let finished = self
                .sched
                .lock()
                .clock
                .as_ref()
                .map(|clock| (clock.started_at(), clock.elapsed()));
            if let Some((started_at, elapsed)) = finished {
                info!(
                    "finished test execution, started {}, elapsed {}s",
                    started_at.format("%H:%M:%S"),
                    elapsed.as_secs()
                );
            }
        }
        result
    }

    async fn poll_events(
        self: &Arc<Self>,
        op_rx: &mut mpsc::Receiver<OperationEvent>,
        term_rx: &mut mpsc::Receiver<RunError>,
        deadline: Option<tokio::time::Instant>,
        stats_ticker: &mut tokio::time::Interval,
    ) -> Result<(), RunError> {
        tokio::select! {
            event = op_rx.recv() => {
                match event {
                    Some(OperationEvent::ClusterUpdate(ci)) => self.perform_cluster_update(&ci),
                    Some(OperationEvent::TaskUpdate(task)) => self.process_task_update(task).await,
                    None => {}
                }
            }
            _ = sleep_until_deadline(deadline) => {
                return Err(RunError::GlobalTimeout {
                    seconds: self.config.timeout.unwrap_or(0),
                });
            }
            err = term_rx.recv() => {
                return Err(err.unwrap_or(RunError::Terminated));
            }
            _ = stats_ticker.tick() => {
                if self.config.statistics.enabled {
                    self.print_statistics();
                }
            }
        }
        Ok(())
    }

    fn perform_cluster_update(&self, ci: &Arc<ClusterInstance>) {
        info!(
            "cluster instance {} is updated: state: {}",
            ci.id,
            ci.display_state()
        );
        let state = ci.state.load();
        if state == ClusterState::Crashed {
            // A task is running on the crashed cluster; abort its attempt.
            let cancel = ci.inner.lock().task_cancel.clone();
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
        }
        if state == ClusterState::Ready {
            if let Some(clock) = self.sched.lock().clock.as_mut() {
                clock.mark_cluster_ready();
            }
        }
    }

    async fn process_task_update(self: &Arc<Self>, task: Arc<TestTask>) {
        let status = task.test.lock().status;
        match status {
            TestStatus::Success | TestStatus::Failed => {
                let (name, key, duration, artifact_dirs) = {
                    let test = task.test.lock();
                    (
                        test.name.clone(),
                        test.key.clone(),
                        test.duration,
                        test.artifact_dirs.clone(),
                    )
                };
                let cluster_task_id = task.binding.lock().cluster_task_id.clone();
                info!(
                    "completed {name} on {cluster_task_id}, {status}, runtime: {}s",
                    duration.as_secs()
                );

                // Only the last two attempts' artifacts are retained.
                if artifact_dirs.len() > 2 {
                    for dir in &artifact_dirs[..artifact_dirs.len() - 2] {
                        let _ = std::fs::remove_dir_all(dir);
                    }
                }

                let groups = task.clusters.lock().clone();
                for (idx, group) in groups.iter().enumerate() {
                    group.tasks.lock().remove(&key);
                    // Record the task only against the first cluster.
                    if idx == 0 {
                        group.completed.lock().insert(key.clone(), Arc::clone(&task));
                    }
                }
                self.complete_task(&task).await;
            }
            TestStatus::RerunRequest if self.config.retest_config.warmup_timeout > 0 => {
                let warmup = Duration::from_secs(self.config.retest_config.warmup_timeout);
                let ctx = Arc::clone(self);
                tokio::spawn(async move {
                    let ids: Vec<String> = task
                        .binding
                        .lock()
                        .instances
                        .iter()
                        .map(|ci| ci.id.clone())
                        .collect();
                    info!("warmup cluster operations: {ids:?} timeout: {warmup:?}");
                    tokio::time::sleep(warmup).await;
                    ctx.reschedule_task(&task).await;
                });
            }
            _ => {
                let name = task.test.lock().name.clone();
                self.reschedule_task(&task).await;
                info!("re-schedule task {name} reason: {status}");
            }
        }
    }

    async fn complete_task(&self, task: &Arc<TestTask>) {
        let limit_hit = {
            let mut sched = self.sched.lock();
            sched.running.remove(&task.task_id);
            sched.completed.push(Arc::clone(task));
            if task.test.lock().status == TestStatus::Failed {
                sched.failed_count += 1;
                self.config.failed_tests_limit != 0
                    && sched.failed_count == self.config.failed_tests_limit
            } else {
                false
            }
        };
        if limit_hit {
            let _ = self.term_tx.try_send(RunError::FailedTestsLimit {
                limit: self.config.failed_tests_limit,
            });
        }
        self.make_instances_ready(task);
    }

    async fn reschedule_task(&self, task: &Arc<TestTask>) {
        self.make_instances_ready(task);
        {
            let mut sched = self.sched.lock();
            sched.running.remove(&task.task_id);
            sched.pending.push(Arc::clone(task));
        }
        let instances = task.binding.lock().instances.clone();
        for ci in &instances {
            self.send_cluster_update(ci).await;
        }
    }

    fn make_instances_ready(&self, task: &Arc<TestTask>) {
        let instances = task.binding.lock().instances.clone();
        for ci in instances {
            ci.state
                .compare_and_swap(ClusterState::Busy, ClusterState::Ready);
            let mut inner = ci.inner.lock();
            inner.task_cancel = None;
            inner.current_task.clear();
        }
    }

    /// One assignment round: every pending task either dispatches, stays
    /// pending, or is terminally skipped when no required group can ever
    /// become ready.
    pub(crate) async fn assign_tasks(self: &Arc<Self>) {
        let pending = std::mem::take(&mut self.sched.lock().pending);
        if pending.is_empty() {
            return;
        }

        let mut still_pending = Vec::new();
        for task in pending {
            let (status, name) = {
                let test = task.test.lock();
                (test.status, test.name.clone())
            };
            if status == TestStatus::Skipped {
                info!("ignoring skipped task: {name}");
                continue;
            }

            let (assigned, unavailable) = self.select_clusters_for_task(&task);
            if !unavailable.is_empty() {
                self.skip_task_unavailable(&task, &unavailable);
                continue;
            }

            let required = task.clusters.lock().len();
            if assigned.len() == required {
                match self.start_task(&task, &assigned).await {
                    Ok(()) => {
                        self.sched.lock().running.insert(task.task_id, Arc::clone(&task));
                    }
                    Err(err) => {
                        let cluster_task_id = task.binding.lock().cluster_task_id.clone();
                        error!("error starting task {name} on {cluster_task_id}: {err}");
                    }
                }
            } else {
                // Next assignment round.
                still_pending.push(task);
            }
        }

        let mut sched = self.sched.lock();
        let appended = std::mem::take(&mut sched.pending);
        still_pending.extend(appended);
        sched.pending = still_pending;
    }

    /// Evaluates every required group: picks the first ready instance,
    /// starts startable ones, and reports groups with no path to
    /// readiness.
    fn select_clusters_for_task(
        self: &Arc<Self>,
        task: &Arc<TestTask>,
    ) -> (Vec<Arc<ClusterInstance>>, Vec<Arc<ClusterGroup>>) {
        let mut to_use = Vec::new();
        let mut unavailable = Vec::new();
        let groups = task.clusters.lock().clone();
        for group in groups {
            let mut assigned = false;
            let mut available = false;
            for ci in &group.instances {
                match ci.state.load() {
                    ClusterState::Added | ClusterState::Crashed => {
                        if self.start_cluster(ci) {
                            available = true;
                        }
                    }
                    ClusterState::Ready => {
                        available = true;
                        to_use.push(Arc::clone(ci));
                        assigned = true;
                    }
                    ClusterState::Busy | ClusterState::Starting | ClusterState::Stopping => {
                        available = true;
                    }
                    ClusterState::NotAvailable | ClusterState::Shutdown => {}
                }
                if assigned {
                    break;
                }
            }
            if !available {
                unavailable.push(group);
            }
        }
        (to_use, unavailable)
    }

    fn skip_task_unavailable(&self, task: &Arc<TestTask>, unavailable: &[Arc<ClusterGroup>]) {
        let names: Vec<&str> = unavailable
            .iter()
            .map(|group| group.config.name.as_str())
            .collect();
        let (name, key) = {
            let test = task.test.lock();
            (test.name.clone(), test.key.clone())
        };
        let cluster_task_id = task.binding.lock().cluster_task_id.clone();
        let total = task.clusters.lock().len();
        error!(
            "skip {name} on {cluster_task_id}: {} of {total} required cluster(s) unavailable: {names:?}",
            unavailable.len()
        );

        task.test.lock().status = TestStatus::SkippedNoClusters;
        let groups = task.clusters.lock().clone();
        for group in &groups {
            group.tasks.lock().remove(&key);
            group.completed.lock().insert(key.clone(), Arc::clone(task));
        }
        self.sched.lock().completed.push(Arc::clone(task));
    }

    /// Turns collected test entries into tasks. Concurrency-retry entries
    /// are queued once per copy with a suffixed key.
    pub(crate) fn create_tasks(&self, tests: Vec<TestEntry>) {
        let mut task_index = 0u64;
        for (order, test) in tests.iter().enumerate() {
            let copies = test.execution.concurrency_retry;
            if copies > 0 {
                for copy in 0..copies {
                    task_index = self.create_task(test, task_index, order, Some(copy));
                }
            } else {
                task_index = self.create_task(test, task_index, order, None);
            }
        }
    }

    fn create_task(
        &self,
        entry: &TestEntry,
        mut task_index: u64,
        order: usize,
        copy: Option<u32>,
    ) -> u64 {
        let selector = entry.execution.cluster_selector.clone();
        if entry.execution.cluster_count > 1 {
            let mut tasks = Vec::new();
            for cluster_name in &selector {
                // A selector name with no matching group is silently
                // dropped from the binding.
                let Some(group) = self
                    .clusters
                    .iter()
                    .find(|group| &group.config.name == cluster_name)
                else {
                    continue;
                };
                if tasks.is_empty() {
                    for split in self.split_test(entry, group) {
                        let task = self.create_single_task(task_index, split, group, order, copy);
                        tasks.push(task);
                        task_index += 1;
                    }
                } else {
                    for task in &tasks {
                        task.clusters.lock().push(Arc::clone(group));
                        let key = task.test.lock().key.clone();
                        group.tasks.lock().insert(key, Arc::clone(task));
                    }
                }
            }
            if tasks.is_empty() {
                error!("{}: no clusters defined of required {selector:?}", entry.name);
            }
            for task in &tasks {
                self.update_task_status(task, &selector);
            }
        } else {
            for group in &self.clusters {
                if selector.is_empty() || selector.contains(&group.config.name) {
                    for split in self.split_test(entry, group) {
                        let task = self.create_single_task(task_index, split, group, order, copy);
                        self.update_task_status(&task, &selector);
                        task_index += 1;
                    }
                }
            }
        }
        task_index
    }

    fn update_task_status(&self, task: &Arc<TestTask>, selector: &[String]) {
        let (name, required) = {
            let test = task.test.lock();
            (test.name.clone(), test.execution.cluster_count)
        };
        let groups = task.clusters.lock().clone();
        if groups.len() < required {
            error!("{name}: not all clusters defined of required {selector:?}");
            task.test.lock().status = TestStatus::Skipped;
        } else {
            task.binding.lock().cluster_task_id = make_group_task_id(&groups);
        }
    }

    fn create_single_task(
        &self,
        task_index: u64,
        mut test: TestEntry,
        group: &Arc<ClusterGroup>,
        order: usize,
        copy: Option<u32>,
    ) -> Arc<TestTask> {
        // The key keeps tasks from crossing in group task maps.
        let selector_key = test.execution.cluster_selector.join("_");
        test.key = match copy {
            Some(copy) => format!("{selector_key}_{}-{copy}", test.name),
            None => format!("{selector_key}_{}", test.name),
        };
        let name = test.name.clone();
        let key = test.key.clone();
        let task = Arc::new(TestTask {
            task_id: task_index,
            test: Mutex::new(test),
            clusters: Mutex::new(vec![Arc::clone(group)]),
            binding: Mutex::new(TaskBinding {
                cluster_task_id: String::new(),
                instances: Vec::new(),
            }),
        });
        group.tasks.lock().insert(key, Arc::clone(&task));

        match self.arguments.count {
            Some(limit) if order >= limit => {
                info!("limit of tests for execution: {limit} is reached, skipping test {name}");
                task.test.lock().status = TestStatus::Skipped;
                self.sched.lock().skipped.push(Arc::clone(&task));
            }
            _ => self.sched.lock().pending.push(Arc::clone(&task)),
        }
        task
    }

    /// Splits a suite entry across the group's fleet; entries without a
    /// suite pass through unchanged.
    fn split_test(&self, entry: &TestEntry, group: &Arc<ClusterGroup>) -> Vec<TestEntry> {
        let Some(suite) = &entry.suite else {
            return vec![entry.fresh_copy()];
        };
        let instances = group.instances.len();
        let total = suite.tests.len();
        let mut per_instance = if instances > 0 { total / instances } else { total };
        if per_instance < self.config.min_suite_size {
            per_instance = self.config.min_suite_size;
        }

        let mut result = Vec::new();
        for idx in 0..instances {
            let mut split = entry.fresh_copy();
            split.name = format!("{}{}", entry.name, idx + 1);
            let start = (idx * per_instance).min(total);
            let remainder_short =
                total as i64 - (((idx + 1) * per_instance) as i64) < per_instance as i64;
            if remainder_short || idx + 1 == instances {
                split.suite = Some(SuiteInfo {
                    name: suite.name.clone(),
                    tests: suite.tests[start..].to_vec(),
                });
                result.push(split);
                return result;
            }
            split.suite = Some(SuiteInfo {
                name: suite.name.clone(),
                tests: suite.tests[start..start + per_instance].to_vec(),
            });
            result.push(split);
        }
        result
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Underscore-joined group names, used before dispatch.
pub(crate) fn make_group_task_id(groups: &[Arc<ClusterGroup>]) -> String {
    groups
        .iter()
        .map(|group| group.config.name.as_str())
        .collect::<Vec<_>>()
        .join("_")
}

/// Underscore-joined instance IDs, used once the binding is concrete.
pub(crate) fn make_instance_task_id(instances: &[Arc<ClusterInstance>]) -> String {
    instances
        .iter()
        .map(|ci| ci.id.as_str())
        .collect::<Vec<_>>()
        .join("_")
}
