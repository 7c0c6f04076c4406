// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The unit-of-work model: test entries collected from executions.
//!
//! Test discovery is external to the engine; executions enumerate their test
//! and suite names directly, and this module turns them into the flat entry
//! list the scheduler consumes.

use crate::{
    config::{ExecutionConfig, ExecutionKind, RunConfig},
    errors::ConfigError,
};
use camino::Utf8PathBuf;
use rand::seq::SliceRandom;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration, time::Instant};
use tracing::info;

/// What a test entry runs as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestKind {
    /// The execution's shell script.
    Shell,
    /// A single test through the language-native test command.
    Native,
    /// A slice of a suite's sub-tests.
    Suite,
}

/// Lifecycle status of a test entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestStatus {
    /// Collected, not yet dispatched.
    Added,
    /// The last attempt passed.
    Success,
    /// The last attempt failed with all clusters alive.
    Failed,
    /// The attempt was cancelled and a required cluster failed liveness.
    Timeout,
    /// Administratively skipped.
    Skipped,
    /// No required cluster group can ever become ready.
    SkippedNoClusters,
    /// A failure matched a restart pattern within the restart budget.
    RerunRequest,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestStatus::Added => "added",
            TestStatus::Success => "success",
            TestStatus::Failed => "failed",
            TestStatus::Timeout => "timeout",
            TestStatus::Skipped => "skipped",
            TestStatus::SkippedNoClusters => "skipped-no-clusters",
            TestStatus::RerunRequest => "rerun-request",
        };
        f.write_str(name)
    }
}

/// One dispatched attempt of a test entry.
#[derive(Clone, Debug)]
pub struct TestEntryExecution {
    /// The attempt's outcome.
    pub status: TestStatus,
    /// 1-based attempt number.
    pub attempt: usize,
    /// Captured stdout/stderr of the attempt.
    pub output_file: Utf8PathBuf,
}

/// A named collection of sub-tests carried by a suite entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuiteInfo {
    /// Suite name.
    pub name: String,
    /// The sub-test slice this entry covers.
    pub tests: Vec<String>,
}

/// A unit of work: one test bound to one execution.
#[derive(Clone, Debug)]
pub struct TestEntry {
    /// Test name.
    pub name: String,
    /// Comma-joined tag filters.
    pub tags: String,
    /// How the entry runs.
    pub kind: TestKind,
    /// Unique key within the run; derived from the cluster selector, the
    /// name and (for concurrency-retry copies) the copy index.
    pub key: String,
    /// The execution this entry belongs to.
    pub execution: Arc<ExecutionConfig>,
    /// The sub-test slice for suite entries.
    pub suite: Option<SuiteInfo>,
    /// The script for shell entries.
    pub run_script: Option<String>,
    /// Current status.
    pub status: TestStatus,
    /// One record per dispatched attempt.
    pub executions: Vec<TestEntryExecution>,
    /// One artifact directory per dispatched attempt.
    pub artifact_dirs: Vec<Utf8PathBuf>,
    /// When the current attempt started running.
    pub started: Option<Instant>,
    /// Total time spent in attempts.
    pub duration: Duration,
    /// Why the entry was skipped, when it was.
    pub skip_message: Option<String>,
}

impl TestEntry {
    fn new(name: String, kind: TestKind, execution: Arc<ExecutionConfig>) -> Self {
        Self {
            name,
            tags: execution.tags.join(","),
            kind,
            key: String::new(),
            execution,
            suite: None,
            run_script: None,
            status: TestStatus::Added,
            executions: Vec::new(),
            artifact_dirs: Vec::new(),
            started: None,
            duration: Duration::ZERO,
            skip_message: None,
        }
    }

    /// A copy with per-attempt state reset, used when one source entry fans
    /// out into several tasks.
    pub fn fresh_copy(&self) -> Self {
        Self {
            executions: Vec::new(),
            artifact_dirs: Vec::new(),
            started: None,
            duration: Duration::ZERO,
            skip_message: None,
            ..self.clone()
        }
    }
}

/// Collects test entries from every execution. Returns the entries plus the
/// per-execution found-test counts used by cluster enablement and fleet
/// sizing.
pub fn collect_tests(
    config: &RunConfig,
) -> Result<(Vec<TestEntry>, HashMap<String, usize>), ConfigError> {
    info!("finding tests");
    let mut tests = Vec::new();
    let mut found = HashMap::new();

    for exec in &config.executions {
        if exec.name.is_empty() {
            return Err(ConfigError::MissingExecutionName);
        }
        let before = tests.len();
        match exec.kind {
            ExecutionKind::Shell => {
                let mut entry =
                    TestEntry::new(exec.name.clone(), TestKind::Shell, Arc::clone(exec));
                entry.run_script = Some(exec.run.clone());
                append_tests(config, &mut tests, vec![entry]);
            }
            ExecutionKind::Test => {
                let mut batch = Vec::new();
                for suite in &exec.suites {
                    let mut entry =
                        TestEntry::new(suite.name.clone(), TestKind::Suite, Arc::clone(exec));
                    entry.suite = Some(SuiteInfo {
                        name: suite.name.clone(),
                        tests: suite.tests.clone(),
                    });
                    batch.push(entry);
                }
                for name in &exec.tests {
                    if !exec.only_run.is_empty() && !exec.only_run.contains(name) {
                        continue;
                    }
                    batch.push(TestEntry::new(name.clone(), TestKind::Native, Arc::clone(exec)));
                }
                append_tests(config, &mut tests, batch);
            }
        }
        found.insert(exec.name.clone(), tests.len() - before);
    }

    info!("total tests found: {}", tests.len());
    if tests.is_empty() {
        return Err(ConfigError::NoTests);
    }
    Ok((tests, found))
}

fn append_tests(config: &RunConfig, tests: &mut Vec<TestEntry>, mut batch: Vec<TestEntry>) {
    if config.shuffle_tests {
        batch.shuffle(&mut rand::thread_rng());
    }
    tests.append(&mut batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;

    fn exec(name: &str) -> ExecutionConfig {
        ExecutionConfig {
            name: name.to_owned(),
            ..ExecutionConfig::default()
        }
    }

    #[test]
    fn shell_execution_yields_one_entry() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig {
                kind: ExecutionKind::Shell,
                run: "echo hello".to_owned(),
                ..exec("smoke")
            })],
            ..RunConfig::default()
        };
        let (tests, found) = collect_tests(&config).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].kind, TestKind::Shell);
        assert_eq!(tests[0].run_script.as_deref(), Some("echo hello"));
        assert_eq!(found["smoke"], 1);
    }

    #[test]
    fn test_execution_yields_suites_and_tests() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig {
                tests: vec!["TestA".to_owned(), "TestB".to_owned()],
                suites: vec![SuiteConfig {
                    name: "TestSuite".to_owned(),
                    tests: vec!["One".to_owned(), "Two".to_owned()],
                }],
                ..exec("integration")
            })],
            ..RunConfig::default()
        };
        let (tests, found) = collect_tests(&config).unwrap();
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[0].kind, TestKind::Suite);
        assert_eq!(tests[0].suite.as_ref().unwrap().tests.len(), 2);
        assert_eq!(tests[1].kind, TestKind::Native);
        assert_eq!(found["integration"], 3);
    }

    #[test]
    fn only_run_filters_plain_tests() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig {
                tests: vec!["TestA".to_owned(), "TestB".to_owned()],
                only_run: vec!["TestB".to_owned()],
                ..exec("integration")
            })],
            ..RunConfig::default()
        };
        let (tests, _) = collect_tests(&config).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "TestB");
    }

    #[test]
    fn empty_execution_name_is_rejected() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig::default())],
            ..RunConfig::default()
        };
        assert!(matches!(
            collect_tests(&config),
            Err(ConfigError::MissingExecutionName)
        ));
    }

    #[test]
    fn no_tests_is_an_error() {
        let config = RunConfig::default();
        assert!(matches!(collect_tests(&config), Err(ConfigError::NoTests)));
    }
}
