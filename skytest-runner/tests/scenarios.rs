// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scheduler scenarios driven through the script-backed
//! provider: real subprocesses, real cluster lifecycles, real reports.

use camino::{Utf8Path, Utf8PathBuf};
use skytest_runner::{
    config::{
        ClusterGroupConfig, ExecutionConfig, ExecutionKind, ProviderScripts, ReportingConfig,
        RetestConfig, RunConfig, StatisticsConfig,
    },
    errors::RunError,
    exec_manager::{ExecutionManager, FsExecutionManager},
    perform_testing,
    providers::default_registry,
    reporter::{Report, TestCaseStatus, TestSuite},
    signal::SignalMode,
    Arguments, RunOutcome,
};
use std::sync::Arc;

fn shell_group(name: &str, instances: usize, retry_count: u32, start: &str) -> ClusterGroupConfig {
    ClusterGroupConfig {
        name: name.to_owned(),
        kind: "shell".to_owned(),
        instances,
        retry_count,
        timeout: 60,
        enabled: true,
        scripts: ProviderScripts {
            start: start.to_owned(),
            destroy: "true".to_owned(),
            config_location: Utf8PathBuf::from("config"),
            ..ProviderScripts::default()
        },
        ..ClusterGroupConfig::default()
    }
}

fn base_config(providers: Vec<ClusterGroupConfig>, executions: Vec<ExecutionConfig>) -> RunConfig {
    RunConfig {
        providers,
        executions: executions.into_iter().map(Arc::new).collect(),
        reporting: ReportingConfig {
            junit_report_file: Some(Utf8PathBuf::from("junit.xml")),
        },
        statistics: StatisticsConfig {
            enabled: false,
            interval: 60,
        },
        timeout: Some(120),
        ..RunConfig::default()
    }
}

async fn run(config: RunConfig, arguments: Arguments) -> (RunOutcome, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    // Keep the artifacts alive for assertions.
    std::mem::forget(dir);
    let manager: Arc<dyn ExecutionManager> = Arc::new(FsExecutionManager::new(root.clone()));
    let providers = default_registry(&manager).unwrap();
    let outcome = perform_testing(config, arguments, providers, manager, SignalMode::Ignore)
        .await
        .unwrap();
    (outcome, root)
}

fn root_suite(report: &Report) -> &TestSuite {
    assert_eq!(report.suites.len(), 1);
    let root = &report.suites[0];
    assert_eq!(root.name, "All tests");
    root
}

fn find_suite<'a>(parent: &'a TestSuite, name: &str) -> &'a TestSuite {
    parent
        .suites
        .iter()
        .find(|suite| suite.name == name)
        .unwrap_or_else(|| panic!("suite {name} not found"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_single_test_passes() {
    let config = base_config(
        vec![shell_group(
            "a",
            1,
            1,
            "echo kube > \"$CLUSTER_ROOT/config\"",
        )],
        vec![ExecutionConfig {
            name: "integration".to_owned(),
            kind: ExecutionKind::Test,
            command: "echo simulated-run".to_owned(),
            timeout: 10,
            tests: vec!["TestX".to_owned()],
            ..ExecutionConfig::default()
        }],
    );

    let (outcome, root) = run(config, Arguments::default()).await;
    assert!(outcome.success(), "fatal: {:?}", outcome.fatal);
    assert_eq!(outcome.failures, 0);

    let summary = root_suite(&outcome.report);
    let exec_suite = find_suite(summary, "integration");
    let cluster_suite = find_suite(exec_suite, "a");
    assert_eq!(cluster_suite.cases.len(), 1);
    let case = &cluster_suite.cases[0];
    assert_eq!(case.name, "TestX");
    assert!(matches!(case.status, TestCaseStatus::Success));
    assert_eq!(case.cluster.as_deref(), Some("a-1"));

    let junit = root.join("junit.xml");
    let xml = std::fs::read_to_string(junit).unwrap();
    assert!(xml.contains("<testsuite name=\"All tests\""));
    assert!(xml.contains("<testcase name=\"TestX\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_exhaustion_reports_cluster_failure() {
    let config = base_config(
        vec![shell_group("a", 1, 2, "echo no capacity; exit 1")],
        vec![ExecutionConfig {
            name: "integration".to_owned(),
            kind: ExecutionKind::Shell,
            run: "echo never-runs".to_owned(),
            ..ExecutionConfig::default()
        }],
    );

    let (outcome, _root) = run(config, Arguments::default()).await;
    assert!(!outcome.success());
    assert_eq!(outcome.failures, 1, "only the cluster startup failure counts");

    let summary = root_suite(&outcome.report);
    let failures_suite = find_suite(summary, "Cluster failures");
    assert_eq!(failures_suite.cases.len(), 1);
    let startup_case = &failures_suite.cases[0];
    assert_eq!(startup_case.name, "Startup-a-1");
    match &startup_case.status {
        TestCaseStatus::Failure(failure) => {
            assert!(failure.message.contains("Cluster start failed a-1"));
            assert!(failure.contents.contains("no capacity"));
        }
        other => panic!("expected a failure, got {other:?}"),
    }

    // The test itself is acknowledged as skipped: its whole fleet is down.
    let exec_suite = find_suite(summary, "integration");
    let cluster_suite = find_suite(exec_suite, "a");
    assert!(matches!(
        cluster_suite.cases[0].status,
        TestCaseStatus::Skipped(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_pattern_recycles_instance_and_passes() {
    let state_dir = tempfile::tempdir().unwrap();
    let state = Utf8Path::from_path(state_dir.path()).unwrap();

    let mut group = shell_group(
        "a",
        1,
        3,
        "echo s >> \"$STATE/starts\"; echo kube > \"$CLUSTER_ROOT/config\"",
    );
    group.env = vec![format!("STATE={state}")];

    let mut config = base_config(
        vec![group],
        vec![ExecutionConfig {
            name: "flaky".to_owned(),
            kind: ExecutionKind::Shell,
            run: "n=$(cat \"$STATE/count\" 2>/dev/null || echo 0); n=$((n+1)); \
                  echo \"$n\" > \"$STATE/count\"; \
                  if [ \"$n\" -lt 3 ]; then echo FLAKE; exit 1; fi; echo ok"
                .to_owned(),
            env: vec![format!("STATE={state}")],
            timeout: 20,
            ..ExecutionConfig::default()
        }],
    );
    config.retest_config = RetestConfig {
        patterns: vec!["FLAKE".to_owned()],
        restart_count: 2,
        allowed_retests: 2,
        warmup_timeout: 0,
        ..RetestConfig::default()
    };

    let (outcome, _root) = run(config, Arguments::default()).await;
    assert!(outcome.success(), "fatal: {:?}", outcome.fatal);

    let summary = root_suite(&outcome.report);
    let exec_suite = find_suite(summary, "flaky");
    let cluster_suite = find_suite(exec_suite, "a");
    assert!(matches!(
        cluster_suite.cases[0].status,
        TestCaseStatus::Success
    ));

    // Three attempts ran.
    let attempts = std::fs::read_to_string(state.join("count")).unwrap();
    assert_eq!(attempts.trim(), "3");
    // The instance was destroyed and recreated once after the second
    // consecutive rerun-request.
    let starts = std::fs::read_to_string(state.join("starts")).unwrap();
    assert_eq!(starts.lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_tests_limit_terminates_the_run() {
    let exec = |name: &str, script: &str| ExecutionConfig {
        name: name.to_owned(),
        kind: ExecutionKind::Shell,
        run: script.to_owned(),
        ..ExecutionConfig::default()
    };
    let mut config = base_config(
        vec![shell_group(
            "a",
            1,
            1,
            "echo kube > \"$CLUSTER_ROOT/config\"",
        )],
        vec![
            exec("t1", "echo first failure; exit 1"),
            exec("t2", "true"),
            exec("t3", "echo second failure; exit 1"),
            exec("t4", "true"),
            exec("t5", "true"),
        ],
    );
    config.failed_tests_limit = 2;

    let (outcome, _root) = run(config, Arguments::default()).await;
    assert!(matches!(
        outcome.fatal,
        Some(RunError::FailedTestsLimit { limit: 2 })
    ));
    assert_eq!(outcome.failures, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_cluster_task_gets_both_configs() {
    let state_dir = tempfile::tempdir().unwrap();
    let state = Utf8Path::from_path(state_dir.path()).unwrap();

    let start = "echo kube > \"$CLUSTER_ROOT/config\"";
    let config = base_config(
        vec![shell_group("a", 1, 1, start), shell_group("b", 1, 1, start)],
        vec![ExecutionConfig {
            name: "interdomain".to_owned(),
            kind: ExecutionKind::Shell,
            run: "echo \"$KUBECONFIG|$KUBECONFIG1\" > \"$STATE/env\"".to_owned(),
            env: vec![format!("STATE={state}")],
            cluster_count: 2,
            cluster_selector: vec!["a".to_owned(), "b".to_owned()],
            ..ExecutionConfig::default()
        }],
    );

    let (outcome, _root) = run(config, Arguments::default()).await;
    assert!(outcome.success(), "fatal: {:?}", outcome.fatal);

    let env = std::fs::read_to_string(state.join("env")).unwrap();
    let (first, second) = env.trim().split_once('|').unwrap();
    assert!(first.ends_with("a-1/config"), "first was {first}");
    assert!(second.ends_with("b-1/config"), "second was {second}");

    let summary = root_suite(&outcome.report);
    let exec_suite = find_suite(summary, "interdomain");
    let cluster_suite = find_suite(exec_suite, "a-b");
    assert_eq!(cluster_suite.cases[0].cluster.as_deref(), Some("a-1_b-1"));
}
