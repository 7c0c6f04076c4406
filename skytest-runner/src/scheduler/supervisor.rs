// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-task supervisor: dispatch preparation and the concurrent unit
//! that runs one attempt end to end.
//!
//! The supervisor never touches the scheduler's queues; its only output is
//! a task-update event. Instance fields are written in short critical
//! sections, never across an await point.

use super::{
    cluster::{ClusterInstance, ClusterState},
    events::OperationEvent,
    imp::{make_instance_task_id, ExecutionContext, TestTask},
    scripts::run_hook,
};
use crate::{
    config::ExecutionConfig,
    errors::{DispatchError, RunnerError},
    model::{TestEntryExecution, TestStatus},
    runners::{make_runner, TestRunner},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::Write,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Applied when an execution declares no timeout.
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Effective attempt budget: twice the configured timeout.
pub(crate) fn test_timeout(exec: &ExecutionConfig) -> Duration {
    if exec.timeout == 0 {
        info!("test timeout is not specified, use default value, 3min");
        DEFAULT_TEST_TIMEOUT
    } else {
        Duration::from_secs(exec.timeout * 2)
    }
}

/// Builds the attempt environment: per-cluster config variables plus the
/// artifacts directory. Explicit `cluster-env` names are used when they
/// match the config count, `KUBECONFIG`/`KUBECONFIG<n>` otherwise.
pub(crate) fn prepare_env(
    exec: &ExecutionConfig,
    artifact_dir: &Utf8Path,
    cluster_configs: &[Utf8PathBuf],
) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if !exec.cluster_env.is_empty() && exec.cluster_env.len() == cluster_configs.len() {
        for (name, config) in exec.cluster_env.iter().zip(cluster_configs) {
            env.push((name.clone(), config.to_string()));
        }
    } else {
        for (idx, config) in cluster_configs.iter().enumerate() {
            let name = if idx == 0 {
                "KUBECONFIG".to_owned()
            } else {
                format!("KUBECONFIG{idx}")
            };
            env.push((name, config.to_string()));
        }
    }
    env.push(("ARTIFACTS_DIR".to_owned(), artifact_dir.to_string()));
    env
}

impl ExecutionContext {
    /// Binds the instances, prepares the attempt artifacts and spawns the
    /// supervisor.
    pub(crate) async fn start_task(
        self: &Arc<Self>,
        task: &Arc<TestTask>,
        instances: &[Arc<ClusterInstance>],
    ) -> Result<(), DispatchError> {
        let name = task.test.lock().name.clone();
        for ci in instances {
            ci.state.store(ClusterState::Busy);
            ci.inner.lock().current_task = name.clone();
        }

        let cluster_task_id = make_instance_task_id(instances);
        {
            let mut binding = task.binding.lock();
            binding.cluster_task_id = cluster_task_id.clone();
            binding.instances = instances.to_vec();
        }

        let folder = self.manager.add_folder(&cluster_task_id, &name);
        task.test.lock().artifact_dirs.push(folder);
        let (file_name, file) = self.manager.open_test_file(&cluster_task_id, &name, "run")?;

        let mut cluster_configs = Vec::new();
        for ci in instances {
            cluster_configs.push(ci.handle.cluster_config().await?);
        }

        let (entry, timeout) = {
            let test = task.test.lock();
            (test.clone(), test_timeout(&test.execution))
        };
        let runner = make_runner(&entry, timeout);

        let ctx = Arc::clone(self);
        let task = Arc::clone(task);
        let instances = instances.to_vec();
        tokio::spawn(async move {
            ctx.execute_task(task, cluster_configs, file, file_name, runner, timeout, instances)
                .await;
        });
        Ok(())
    }

    /// One attempt, end to end: test delay, hooks, the runner under its
    /// timeout, on-fail handling, restart-on-pattern accounting, liveness
    /// probing and the final task-update event.
    #[allow(clippy::too_many_arguments)]
    async fn execute_task(
        self: Arc<Self>,
        task: Arc<TestTask>,
        cluster_configs: Vec<Utf8PathBuf>,
        file: File,
        file_name: Utf8PathBuf,
        runner: Box<dyn TestRunner>,
        timeout: Duration,
        instances: Vec<Arc<ClusterInstance>>,
    ) {
        let cluster_task_id = task.binding.lock().cluster_task_id.clone();
        let (name, exec, artifact_dir) = {
            let test = task.test.lock();
            (
                test.name.clone(),
                Arc::clone(&test.execution),
                test.artifact_dirs.last().cloned().unwrap_or_default(),
            )
        };

        let test_delay = self.test_delay(&task, &cluster_task_id);
        if test_delay != 0 {
            info!("cluster {cluster_task_id} requires {test_delay} seconds delay between tests");
            tokio::time::sleep(Duration::from_secs(test_delay)).await;
            info!("cluster {cluster_task_id}: {test_delay} seconds delay between tests completed");
        }

        let st = Instant::now();
        let env = prepare_env(&exec, &artifact_dir, &cluster_configs);

        let msg = format!("Starting {name} on {cluster_task_id}");
        info!("{msg}");
        let _ = writeln!(&mut &file, "{msg}");
        let _ = writeln!(
            &mut &file,
            "Command line {}\nenv=={env:?} \n",
            runner.cmd_line()
        );

        let cancel = CancellationToken::new();
        for ci in &instances {
            ci.inner.lock().task_cancel = Some(cancel.clone());
        }

        self.handle_before_after(&exec, &file, &cluster_configs, &instances)
            .await;
        task.test.lock().started = Some(Instant::now());

        let run_fut = runner.run(&cancel, &env, &file);
        tokio::pin!(run_fut);
        let mut result = tokio::select! {
            res = &mut run_fut => res,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                run_fut.await
            }
        };

        result = match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // Go over every cluster to perform cleanup.
                let mut wrapped = err;
                for (idx, config) in cluster_configs.iter().enumerate() {
                    let msg = format!(
                        "{name}: OnFail: running on fail script operations \
                         with KUBECONFIG={config} on cloud {}",
                        instances[idx].id
                    );
                    info!("{msg}");
                    let _ = writeln!(&mut &file, "{msg}");
                    let hook_env = prepare_env(&exec, &artifact_dir, std::slice::from_ref(config));
                    if let Err(on_fail) =
                        run_hook("OnFail", &exec.on_fail, &exec.env, &hook_env, &file).await
                    {
                        wrapped = RunnerError::OnFail {
                            source: Box::new(wrapped),
                            on_fail: on_fail.to_string(),
                        };
                    }
                }
                Err(wrapped)
            }
        };

        // Check if the test asks for a restart and has attempts left.
        let retest = &self.config.retest_config;
        if let Err(err) = &result {
            if !self.restart_patterns.is_empty()
                && retest.restart_count > 0
                && self.match_restart_request(&file_name)
            {
                let attempts = task.test.lock().executions.len();
                if attempts < retest.restart_count {
                    for ci in &instances {
                        let recycle = {
                            let mut inner = ci.inner.lock();
                            inner.retest_counter += 1;
                            if inner.retest_counter == retest.allowed_retests {
                                inner.retest_counter = 0;
                                // The monitor is not cancelled; it observes
                                // the destroy on its next probe and exits.
                                inner.cancel_monitor = None;
                                true
                            } else {
                                false
                            }
                        };
                        if recycle {
                            error!(
                                "reached a limit of re-tests per cluster instance: \
                                 {name} {} {}",
                                ci.id, retest.allowed_retests
                            );
                            let _ = self.destroy_cluster(ci, true, false).await;
                        }
                        ci.inner.lock().task_cancel = None;
                    }
                    self.update_test_execution(&task, &file_name, TestStatus::RerunRequest)
                        .await;
                } else {
                    let msg = format!(
                        "Test {name} retry count {} exceed: err: {err}",
                        retest.restart_count
                    );
                    error!("{msg}");
                    let _ = writeln!(&mut &file, "{err}");
                    let status = match retest.retest_fail_result {
                        crate::config::RetestFailResult::Skip => {
                            task.test.lock().skip_message = Some(msg);
                            TestStatus::Skipped
                        }
                        crate::config::RetestFailResult::Fail => TestStatus::Failed,
                    };
                    self.update_test_execution(&task, &file_name, status).await;
                }
                return;
            }
        }

        // The attempt did not request a rerun; the instances' streaks end.
        for ci in &instances {
            ci.inner.lock().retest_counter = 0;
        }

        task.test.lock().duration = st.elapsed();
        match result {
            Err(err) => {
                let mut cluster_dead = false;
                for ci in &instances {
                    if let Err(probe) = ci.handle.check_alive().await {
                        error!(
                            "task failed because cluster is not valid: {name} {} {probe}",
                            ci.id
                        );
                        cluster_dead = true;
                        let _ = self.destroy_cluster(ci, true, false).await;
                    }
                    ci.inner.lock().task_cancel = None;
                }
                if cluster_dead {
                    error!("test is canceled due timeout and cluster error, will be re-run");
                    self.update_test_execution(&task, &file_name, TestStatus::Timeout)
                        .await;
                } else {
                    error!("{err}");
                    let _ = writeln!(&mut &file, "{err}");
                    self.update_test_execution(&task, &file_name, TestStatus::Failed)
                        .await;
                }
            }
            Ok(()) => {
                self.update_test_execution(&task, &file_name, TestStatus::Success)
                    .await;
            }
        }
    }

    /// The delay before this attempt: the max `test-delay` over the task's
    /// groups, applied only when the binding has already completed a task.
    fn test_delay(&self, task: &Arc<TestTask>, cluster_task_id: &str) -> u64 {
        let first = {
            let sched = self.sched.lock();
            !sched
                .completed
                .iter()
                .any(|t| t.binding.lock().cluster_task_id == cluster_task_id)
        };
        if first {
            return 0;
        }
        task.clusters
            .lock()
            .iter()
            .map(|group| group.config.test_delay)
            .max()
            .unwrap_or(0)
    }

    /// Runs the previous execution's after hook and the new execution's
    /// before hook on every instance whose running execution changed. Hook
    /// failures are logged but never fail the task.
    async fn handle_before_after(
        &self,
        exec: &Arc<ExecutionConfig>,
        file: &File,
        cluster_configs: &[Utf8PathBuf],
        instances: &[Arc<ClusterInstance>],
    ) {
        for ci in instances {
            let prev = {
                let mut inner = ci.inner.lock();
                match &inner.running_execution {
                    Some(current) if Arc::ptr_eq(current, exec) => continue,
                    _ => inner.running_execution.replace(Arc::clone(exec)),
                }
            };
            if let Some(prev) = prev {
                for config in cluster_configs {
                    let env = vec![("KUBECONFIG".to_owned(), config.to_string())];
                    if let Err(err) = run_hook("After", &prev.after, &prev.env, &env, file).await {
                        warn!(
                            "an error during run After script for execution: {}, error: {err}",
                            exec.name
                        );
                    }
                }
            }
            for config in cluster_configs {
                let env = vec![("KUBECONFIG".to_owned(), config.to_string())];
                if let Err(err) = run_hook("Before", &exec.before, &exec.env, &env, file).await {
                    warn!(
                        "an error during run Before script for execution: {}, error: {err}",
                        exec.name
                    );
                }
            }
        }
    }

    /// Whether the attempt's output contains a line matching any restart
    /// pattern.
    fn match_restart_request(&self, file_name: &Utf8Path) -> bool {
        let Ok(contents) = std::fs::read_to_string(file_name) else {
            return false;
        };
        contents
            .lines()
            .any(|line| self.restart_patterns.iter().any(|pattern| pattern.is_match(line)))
    }

    /// Records the attempt and emits the task-update event.
    pub(crate) async fn update_test_execution(
        &self,
        task: &Arc<TestTask>,
        file_name: &Utf8Path,
        status: TestStatus,
    ) {
        {
            let mut test = task.test.lock();
            test.status = status;
            let attempt = test.executions.len() + 1;
            test.executions.push(TestEntryExecution {
                status,
                attempt,
                output_file: file_name.to_owned(),
            });
        }
        let _ = self
            .op_tx
            .send(OperationEvent::TaskUpdate(Arc::clone(task)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_with(cluster_env: Vec<String>, timeout: u64) -> ExecutionConfig {
        ExecutionConfig {
            name: "integration".to_owned(),
            cluster_env,
            timeout,
            ..ExecutionConfig::default()
        }
    }

    #[test]
    fn env_uses_kubeconfig_numbering() {
        let exec = exec_with(Vec::new(), 0);
        let configs = vec![Utf8PathBuf::from("/a/config"), Utf8PathBuf::from("/b/config")];
        let env = prepare_env(&exec, Utf8Path::new("/art/1"), &configs);
        assert_eq!(
            env,
            vec![
                ("KUBECONFIG".to_owned(), "/a/config".to_owned()),
                ("KUBECONFIG1".to_owned(), "/b/config".to_owned()),
                ("ARTIFACTS_DIR".to_owned(), "/art/1".to_owned()),
            ]
        );
    }

    #[test]
    fn env_uses_explicit_names_when_lengths_match() {
        let exec = exec_with(vec!["CFG_A".to_owned(), "CFG_B".to_owned()], 0);
        let configs = vec![Utf8PathBuf::from("/a"), Utf8PathBuf::from("/b")];
        let env = prepare_env(&exec, Utf8Path::new("/art"), &configs);
        assert_eq!(env[0], ("CFG_A".to_owned(), "/a".to_owned()));
        assert_eq!(env[1], ("CFG_B".to_owned(), "/b".to_owned()));
    }

    #[test]
    fn env_falls_back_on_length_mismatch() {
        let exec = exec_with(vec!["ONLY_ONE".to_owned()], 0);
        let configs = vec![Utf8PathBuf::from("/a"), Utf8PathBuf::from("/b")];
        let env = prepare_env(&exec, Utf8Path::new("/art"), &configs);
        assert_eq!(env[0].0, "KUBECONFIG");
        assert_eq!(env[1].0, "KUBECONFIG1");
    }

    #[test]
    fn timeout_doubles_and_defaults() {
        assert_eq!(test_timeout(&exec_with(Vec::new(), 10)), Duration::from_secs(20));
        assert_eq!(test_timeout(&exec_with(Vec::new(), 0)), DEFAULT_TEST_TIMEOUT);
    }
}
