// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration: the YAML document that declares cluster groups,
//! executions and run-wide policies.
//!
//! A configuration file may pull in further files through `imports`; imported
//! files contribute their `providers` and `executions` arrays to the root
//! document before the run starts.

use crate::errors::ConfigError;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// The default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".skytest.yaml";

/// Applied when the global `timeout` field is present but zero.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 86_400;

/// Applied when a group's start/destroy timeout is zero.
const DEFAULT_CLUSTER_TIMEOUT_SECS: u64 = 15 * 60;

/// Top-level run configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunConfig {
    /// Files or `dir/pattern` entries merged into this config before the run.
    pub imports: Vec<String>,

    /// Root directory for run artifacts.
    pub root: Utf8PathBuf,

    /// Cluster group declarations.
    pub providers: Vec<ClusterGroupConfig>,

    /// Execution declarations.
    pub executions: Vec<Arc<ExecutionConfig>>,

    /// Report output settings.
    pub reporting: ReportingConfig,

    /// Global run timeout in seconds. Zero applies a default; an absent
    /// field leaves the run unbounded.
    pub timeout: Option<u64>,

    /// Statistics printer settings.
    pub statistics: StatisticsConfig,

    /// Periodic health checks; a failing check terminates the run.
    pub health_check: Vec<HealthCheckConfig>,

    /// Restart-on-pattern policy.
    pub retest_config: RetestConfig,

    /// Terminate the run once this many tests have failed (0 = unlimited).
    pub failed_tests_limit: u32,

    /// Shuffle collected tests before task creation.
    pub shuffle_tests: bool,

    /// Fleet sizing input: how many tests one instance is expected to absorb.
    pub tests_per_cluster_instance: usize,

    /// Lower bound on the number of sub-tests a suite split may produce per
    /// instance.
    pub min_suite_size: usize,

    /// When non-empty, restricts every execution to the named tests.
    pub only_run: Vec<String>,
}

/// A declared fleet from one provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterGroupConfig {
    /// Group name, referenced by execution cluster selectors.
    pub name: String,

    /// Provider kind (e.g. `shell`).
    pub kind: String,

    /// Maximum number of instances; the actual fleet is sized down from the
    /// relevant test count.
    pub instances: usize,

    /// Start/destroy timeout in seconds (0 = 15 minutes).
    pub timeout: u64,

    /// How many restarts one instance may attempt before it is marked
    /// not-available.
    pub retry_count: u32,

    /// Seconds to sleep after a destroy completes.
    pub stop_delay: u64,

    /// Seconds to sleep between consecutive tests on the same binding.
    pub test_delay: u64,

    /// Whether the group participates in the run.
    pub enabled: bool,

    /// `KEY=VALUE` pairs passed to provider scripts.
    pub env: Vec<String>,

    /// Scripts for script-backed providers.
    pub scripts: ProviderScripts,
}

/// Scripts a script-backed provider runs to manage an instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderScripts {
    /// Provisions the cluster; runs once per (re)start.
    pub start: String,

    /// Tears the cluster down.
    pub destroy: String,

    /// Liveness probe; a non-zero exit marks the cluster dead.
    pub alive: String,

    /// One-shot pre-run cleanup of leaked clusters.
    pub cleanup: String,

    /// Path (relative to the instance root) of the cluster config file the
    /// start script produces.
    pub config_location: Utf8PathBuf,
}

/// One declared execution: a family of tests sharing scripts, environment
/// and cluster requirements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutionConfig {
    /// Execution name; used as the report suite name.
    pub name: String,

    /// Execution kind.
    pub kind: ExecutionKind,

    /// Shell executions: the script to run.
    pub run: String,

    /// Test executions: the language-native test command the runner extends
    /// with name and tag filters.
    pub command: String,

    /// Working directory for test commands.
    pub package_root: Utf8PathBuf,

    /// Per-test timeout in seconds (0 = 3-minute default). The effective
    /// attempt budget doubles this value.
    pub timeout: u64,

    /// How many clusters a single test needs at once.
    pub cluster_count: usize,

    /// Cluster group names this execution may run on; empty means any.
    pub cluster_selector: Vec<String>,

    /// When positive, every test is queued this many times.
    pub concurrency_retry: u32,

    /// Test names this execution contributes.
    pub tests: Vec<String>,

    /// Named suites of sub-tests; suites are split across a group's fleet.
    pub suites: Vec<SuiteConfig>,

    /// Tag filters passed to the test command.
    pub tags: Vec<String>,

    /// `KEY=VALUE` pairs added to every test and hook environment.
    pub env: Vec<String>,

    /// Explicit names for per-cluster config env variables; when the length
    /// matches the cluster count these replace `KUBECONFIG`/`KUBECONFIG<n>`.
    pub cluster_env: Vec<String>,

    /// Script run when an instance switches to this execution.
    pub before: String,

    /// Script run when an instance switches away from this execution.
    pub after: String,

    /// Script run after a failed attempt.
    pub on_fail: String,

    /// When non-empty, restricts this execution to the named tests.
    pub only_run: Vec<String>,
}

/// The kind of an execution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionKind {
    /// A single shell script test.
    Shell,
    /// Tests run through a language-native test command.
    #[default]
    Test,
}

/// A named suite of sub-tests within a test execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SuiteConfig {
    /// Suite name; becomes the base of split entry names.
    pub name: String,

    /// Sub-test names.
    pub tests: Vec<String>,
}

/// Report output settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReportingConfig {
    /// Where to write the JUnit report, relative to the artifact root.
    pub junit_report_file: Option<Utf8PathBuf>,
}

/// Statistics printer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatisticsConfig {
    /// Whether periodic statistics are printed.
    pub enabled: bool,

    /// Ticker interval in seconds.
    pub interval: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
        }
    }
}

/// A periodic health check. A non-zero exit of `run` pushes a fatal error
/// onto the termination channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthCheckConfig {
    /// Display name.
    pub name: String,

    /// The probe script.
    pub run: String,

    /// Probe interval in seconds.
    pub interval: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            run: String::new(),
            interval: 60,
        }
    }
}

/// Restart-on-pattern policy: failures whose output matches a pattern are
/// re-queued within a bounded budget.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetestConfig {
    /// Output patterns that mark a failure as restartable.
    pub patterns: Vec<String>,

    /// Upper bound on attempts for a restartable test.
    pub restart_count: usize,

    /// Consecutive rerun-requests one instance absorbs before it is
    /// destroyed and recreated.
    pub allowed_retests: u32,

    /// Seconds to wait before re-queueing a rerun-request.
    pub warmup_timeout: u64,

    /// What a test becomes when its restart budget is exhausted.
    pub retest_fail_result: RetestFailResult,
}

/// Terminal result for a test that exhausted its restart budget.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetestFailResult {
    /// Report the test as failed.
    #[default]
    Fail,
    /// Report the test as skipped.
    Skip,
}

impl RunConfig {
    /// Loads a configuration file and processes its imports.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_one(path)?;
        config.perform_import()?;
        Ok(config)
    }

    fn read_one(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_owned(),
            error,
        })?;
        Self::parse(&content, path)
    }

    /// Parses a configuration document.
    pub fn parse(content: &str, path: &Utf8Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|error| ConfigError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Merges every `imports` entry into this config. An entry is either a
    /// plain file path or `dir/pattern` where the pattern is a regular
    /// expression matched against file names in `dir`.
    pub fn perform_import(&mut self) -> Result<(), ConfigError> {
        let imports = std::mem::take(&mut self.imports);
        for entry in &imports {
            let path = Utf8Path::new(entry);
            if path.is_file() {
                self.import_file(path)?;
                continue;
            }
            let (dir, pattern) = split_dir_pattern(path);
            let matcher =
                Regex::new(pattern).map_err(|error| ConfigError::ImportPattern {
                    pattern: pattern.to_owned(),
                    error,
                })?;
            for file in list_files(&dir) {
                if matcher.is_match(file.file_name().unwrap_or_default()) {
                    self.import_file(&file)?;
                }
            }
        }
        self.imports = imports;
        Ok(())
    }

    fn import_file(&mut self, path: &Utf8Path) -> Result<(), ConfigError> {
        let imported = Self::read_one(path)?;
        self.executions.extend(imported.executions);
        self.providers.extend(imported.providers);
        Ok(())
    }

    /// Imposes a top-level `only-run` list onto every execution.
    pub fn impose_only_run(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        info!("imposing top-level 'only-run' tests to all executions: {names:?}");
        for exec in &mut self.executions {
            let exec = Arc::make_mut(exec);
            if !exec.only_run.is_empty() {
                warn!("overwriting non-empty 'only-run' on execution '{}'", exec.name);
            }
            exec.only_run = names.to_vec();
        }
    }

    /// Imposes top-level tags onto every execution.
    pub fn impose_tags(&mut self, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        info!("imposing top-level 'tags' to all executions: {tags:?}");
        for exec in &mut self.executions {
            Arc::make_mut(exec).tags = tags.to_vec();
        }
    }

    /// The global run deadline, if any. A present-but-zero field applies a
    /// one-day default; an absent field leaves the run unbounded.
    pub fn global_timeout(&self) -> Option<Duration> {
        self.timeout.map(|secs| {
            if secs == 0 {
                info!(
                    "global timeout is not specified, use default value, {}s",
                    DEFAULT_RUN_TIMEOUT_SECS
                );
                Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS)
            } else {
                Duration::from_secs(secs)
            }
        })
    }
}

impl ClusterGroupConfig {
    /// Start/destroy timeout with the 15-minute default applied.
    pub fn cluster_timeout(&self) -> Duration {
        if self.timeout == 0 {
            info!("cluster timeout is not specified, use default value 15min");
            Duration::from_secs(DEFAULT_CLUSTER_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

impl RetestConfig {
    /// Compiles the restart patterns.
    pub fn compiled_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|error| ConfigError::RestartPattern {
                    pattern: pattern.clone(),
                    error,
                })
            })
            .collect()
    }
}

fn split_dir_pattern(path: &Utf8Path) -> (Utf8PathBuf, &str) {
    let pattern = path.file_name().unwrap_or_default();
    let dir = path
        .parent()
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    (dir, pattern)
}

fn list_files(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = dir.read_dir_utf8() else {
        return files;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path().to_owned());
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
root: ".results"
providers:
  - name: packet-a
    kind: shell
    instances: 2
    timeout: 900
    retry-count: 2
    stop-delay: 10
    test-delay: 5
    enabled: true
    scripts:
      start: "./start.sh"
      destroy: "./destroy.sh"
      alive: "kubectl get nodes"
      config-location: "config"
executions:
  - name: integration
    kind: test
    command: "go test ."
    timeout: 300
    cluster-count: 1
    cluster-selector: [packet-a]
    tests: [TestBasic, TestRecovery]
    suites:
      - name: TestSuite
        tests: [TestOne, TestTwo, TestThree]
    env: ["STORE=memory"]
    before: "echo before"
    after: "echo after"
    on-fail: "kubectl describe pods"
reporting:
  junit-report-file: "results/junit.xml"
timeout: 7200
statistics:
  enabled: true
  interval: 30
retest-config:
  patterns: ["FLAKE", "connection refused"]
  restart-count: 2
  allowed-retests: 2
  warmup-timeout: 15
  retest-fail-result: skip
failed-tests-limit: 5
tests-per-cluster-instance: 4
min-suite-size: 2
"#;

    #[test]
    fn parse_full_config() {
        let config = RunConfig::parse(FULL_CONFIG, Utf8Path::new("test.yaml")).unwrap();
        assert_eq!(config.providers.len(), 1);
        let group = &config.providers[0];
        assert_eq!(group.name, "packet-a");
        assert_eq!(group.instances, 2);
        assert_eq!(group.retry_count, 2);
        assert!(group.enabled);
        assert_eq!(group.scripts.start, "./start.sh");

        assert_eq!(config.executions.len(), 1);
        let exec = &config.executions[0];
        assert_eq!(exec.kind, ExecutionKind::Test);
        assert_eq!(exec.tests, vec!["TestBasic", "TestRecovery"]);
        assert_eq!(exec.suites[0].tests.len(), 3);
        assert_eq!(exec.cluster_selector, vec!["packet-a"]);

        assert_eq!(config.retest_config.restart_count, 2);
        assert_eq!(config.retest_config.retest_fail_result, RetestFailResult::Skip);
        assert_eq!(config.failed_tests_limit, 5);
        assert_eq!(config.min_suite_size, 2);
        assert_eq!(
            config.reporting.junit_report_file.as_deref(),
            Some(Utf8Path::new("results/junit.xml"))
        );
    }

    #[test]
    fn round_trip_is_stable() {
        let parsed = RunConfig::parse(FULL_CONFIG, Utf8Path::new("test.yaml")).unwrap();
        let serialized = serde_yaml::to_string(&parsed).unwrap();
        let reparsed = RunConfig::parse(&serialized, Utf8Path::new("test.yaml")).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn defaults_apply() {
        let config = RunConfig::parse("executions: []", Utf8Path::new("t.yaml")).unwrap();
        assert!(config.statistics.enabled);
        assert_eq!(config.statistics.interval, 60);
        assert_eq!(config.timeout, None);
        assert!(config.global_timeout().is_none());
        assert_eq!(config.retest_config.retest_fail_result, RetestFailResult::Fail);
    }

    #[test]
    fn zero_timeout_uses_default() {
        let config = RunConfig::parse("timeout: 0", Utf8Path::new("t.yaml")).unwrap();
        assert_eq!(
            config.global_timeout(),
            Some(Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS))
        );
    }

    #[test]
    fn imports_merge_providers_and_executions() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(
            dir_path.join("extra.yaml"),
            "providers:\n  - name: extra\n    kind: shell\nexecutions:\n  - name: more\n",
        )
        .unwrap();
        std::fs::write(dir_path.join("ignored.txt"), "not: yaml").unwrap();

        let content = format!("imports: [\"{dir_path}/.*\\\\.yaml\"]\n");
        let mut config = RunConfig::parse(&content, Utf8Path::new("t.yaml")).unwrap();
        config.perform_import().unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name, "extra");
        assert_eq!(config.executions.len(), 1);
        assert_eq!(config.executions[0].name, "more");
    }

    #[test]
    fn impose_only_run_overwrites_executions() {
        let mut config = RunConfig::parse(FULL_CONFIG, Utf8Path::new("t.yaml")).unwrap();
        config.impose_only_run(&["TestBasic".to_owned()]);
        assert_eq!(config.executions[0].only_run, vec!["TestBasic"]);
    }
}
