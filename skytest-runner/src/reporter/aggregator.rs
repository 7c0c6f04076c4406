// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builds the report from completed tasks and cluster records.
//!
//! Tasks are grouped twice: by execution name, then by the dash-joined
//! names of the groups they were bound to. A sibling "Cluster failures"
//! suite reports every instance of a fully-failed group.

use crate::{
    errors::ReportError,
    model::TestStatus,
    reporter::junit::{Failure, Report, SkipMessage, TestCase, TestCaseStatus, TestSuite},
    scheduler::{
        cluster::{ClusterGroup, ClusterInstance, ClusterState, OperationRecord},
        imp::{ExecutionContext, TestTask},
    },
};
use indexmap::IndexMap;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{error, warn};

impl ExecutionContext {
    /// Produces the aggregated report and the total failure count, and
    /// writes the report file when one is configured.
    pub(crate) fn generate_report(&self) -> Result<(Report, usize), ReportError> {
        let mut summary = TestSuite::new("All tests");

        let mut total_failures = 0;
        let mut total_tests = 0;
        let mut total_time = Duration::ZERO;

        for (exec_name, tasks) in self.tasks_by_execution() {
            let mut exec_suite = TestSuite::new(&exec_name);

            let mut by_cluster: IndexMap<String, Vec<Arc<TestTask>>> = IndexMap::new();
            for task in tasks {
                let name = cluster_suite_name(&task.clusters.lock());
                by_cluster.entry(name).or_default().push(task);
            }

            let mut exec_failures = 0;
            let mut exec_tests = 0;
            let mut exec_time = Duration::ZERO;

            for (cluster_name, tasks) in by_cluster {
                let mut cluster_suite = TestSuite::new(&cluster_name);
                let mut failures = 0;
                let mut time = Duration::ZERO;
                for task in &tasks {
                    let (case, failed) = self.test_case_for(task);
                    time += case.time;
                    if failed {
                        failures += 1;
                    }
                    cluster_suite.cases.push(case);
                }
                cluster_suite.tests = tasks.len();
                cluster_suite.failures = failures;
                cluster_suite.time = time;

                exec_failures += failures;
                exec_tests += tasks.len();
                exec_time += time;
                exec_suite.suites.push(cluster_suite);
            }

            exec_suite.tests = exec_tests;
            exec_suite.failures = exec_failures;
            exec_suite.time = exec_time;
            summary.suites.push(exec_suite);

            total_failures += exec_failures;
            total_tests += exec_tests;
            total_time += exec_time;
        }

        let (failures_time, failures_count, mut failures_suite) = self.cluster_failures_suite();
        if failures_count > 0 {
            failures_suite.tests = failures_count;
            failures_suite.failures = failures_count;
            total_failures += failures_count;
            total_time += failures_time;
            summary.suites.push(failures_suite);
        }

        summary.tests = total_tests;
        summary.failures = total_failures;
        summary.time = total_time;
        let report = Report {
            suites: vec![summary],
        };

        if let Some(path) = &self.config.reporting.junit_report_file {
            let xml = report.to_xml()?;
            self.manager
                .add_file(path, xml.as_bytes())
                .map_err(|error| ReportError::Write {
                    path: path.clone(),
                    error,
                })?;
        }
        if total_failures > 0 {
            error!("there are failed tests: {total_failures}");
        }
        Ok((report, total_failures))
    }

    /// Every task the run knows about, grouped by execution name. A task
    /// bound to several groups appears once.
    fn tasks_by_execution(&self) -> IndexMap<String, Vec<Arc<TestTask>>> {
        let mut seen = HashSet::new();
        let mut map: IndexMap<String, Vec<Arc<TestTask>>> = IndexMap::new();
        for group in &self.clusters {
            let maps = [&group.tasks, &group.completed];
            for tasks in maps {
                for task in tasks.lock().values() {
                    if !seen.insert(task.task_id) {
                        continue;
                    }
                    let exec_name = task.test.lock().execution.name.clone();
                    map.entry(exec_name).or_default().push(Arc::clone(task));
                }
            }
        }
        map
    }

    /// One report case for a task. Returns the case and whether it counts
    /// as a failure.
    fn test_case_for(&self, task: &Arc<TestTask>) -> (TestCase, bool) {
        let test = task.test.lock();
        let cluster_task_id = task.binding.lock().cluster_task_id.clone();

        let (status, failed) = match test.status {
            TestStatus::Failed | TestStatus::Timeout => {
                let mut contents = String::new();
                for (idx, attempt) in test.executions.iter().enumerate() {
                    contents.push_str(&format!(
                        "Execution attempt: {idx} Output file: {}\n",
                        attempt.output_file
                    ));
                    match std::fs::read_to_string(&attempt.output_file) {
                        Ok(output) => contents.push_str(&output),
                        Err(err) => {
                            warn!("failed to read stored output {}", attempt.output_file);
                            contents.push_str(&format!(
                                "Failed to read stored output:\n{}\n{err}",
                                attempt.output_file
                            ));
                        }
                    }
                }
                (
                    TestCaseStatus::Failure(Failure {
                        message: format!("Test execution failed {}", test.name),
                        contents,
                    }),
                    true,
                )
            }
            TestStatus::Skipped => {
                let message = test
                    .skip_message
                    .clone()
                    .unwrap_or_else(|| "By limit of number of tests to run".to_owned());
                (TestCaseStatus::Skipped(SkipMessage { message }), false)
            }
            TestStatus::SkippedNoClusters => {
                let message =
                    "No clusters are available, all clusters reached restart limits...".to_owned();
                // Count the test as failed unless a required cluster group
                // was completely down; then it could never have run.
                if has_failed_cluster(task) {
                    (TestCaseStatus::Skipped(SkipMessage { message }), false)
                } else {
                    (
                        TestCaseStatus::Failure(Failure {
                            message,
                            contents: String::new(),
                        }),
                        true,
                    )
                }
            }
            TestStatus::Success | TestStatus::Added | TestStatus::RerunRequest => {
                (TestCaseStatus::Success, false)
            }
        };

        let mut case = TestCase::new(&test.name, status);
        case.time = test.duration;
        if !cluster_task_id.is_empty() {
            case.cluster = Some(cluster_task_id);
        }
        (case, failed)
    }

    /// Builds the "Cluster failures" suite: one case per instance of every
    /// group whose fleet is entirely not-available.
    fn cluster_failures_suite(&self) -> (Duration, usize, TestSuite) {
        let mut suite = TestSuite::new("Cluster failures");
        let mut count = 0;
        let mut time = Duration::ZERO;

        for group in &self.clusters {
            let available = group
                .instances
                .iter()
                .filter(|ci| ci.state.load() != ClusterState::NotAvailable)
                .count();
            if available > 0 {
                continue;
            }
            for ci in &group.instances {
                if ci.state.load() != ClusterState::NotAvailable {
                    continue;
                }
                if let Some(record) = first_failure_record(ci) {
                    suite.cases.push(cluster_failure_case(&ci.id, &record));
                    time += record.duration;
                    count += 1;
                }
            }
        }
        suite.time = time;
        (time, count, suite)
    }
}

fn cluster_suite_name(groups: &[Arc<ClusterGroup>]) -> String {
    groups
        .iter()
        .map(|group| group.config.name.as_str())
        .collect::<Vec<_>>()
        .join("-")
}

fn has_failed_cluster(task: &Arc<TestTask>) -> bool {
    for group in task.clusters.lock().iter() {
        let failed = group
            .instances
            .iter()
            .filter(|ci| ci.state.load() == ClusterState::NotAvailable)
            .count();
        if failed == group.instances.len() {
            return true;
        }
    }
    false
}

fn first_failure_record(ci: &Arc<ClusterInstance>) -> Option<OperationRecord> {
    let inner = ci.inner.lock();
    inner
        .records
        .iter()
        .find(|record| record.error.is_some())
        .cloned()
        .or_else(|| inner.records.first().cloned())
}

fn cluster_failure_case(id: &str, record: &OperationRecord) -> TestCase {
    let mut contents = format!(
        "Error: {}\n",
        record.error.as_deref().unwrap_or("unknown error")
    );
    if let Some(log_file) = &record.log_file {
        if let Ok(log) = std::fs::read_to_string(log_file) {
            contents.push_str(&log);
        }
    }
    let mut case = TestCase::new(
        format!("Startup-{id}"),
        TestCaseStatus::Failure(Failure {
            message: format!("Cluster start failed {id}"),
            contents,
        }),
    );
    case.time = record.duration;
    case
}
