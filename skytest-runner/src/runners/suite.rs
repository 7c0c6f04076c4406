// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite slice runner.

use super::{native::test_cmd_line, run_command, TestRunner};
use crate::{errors::RunnerError, model::TestEntry};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::{fs::File, time::Duration};
use tokio_util::sync::CancellationToken;

/// Runs a suite entry's sub-test slice as one filtered invocation of the
/// test command.
pub struct SuiteRunner {
    cmd_line: String,
    package_root: Utf8PathBuf,
    exec_env: Vec<String>,
}

impl SuiteRunner {
    /// Creates a runner for a suite entry.
    pub fn new(entry: &TestEntry, timeout: Duration) -> Self {
        let filter = entry
            .suite
            .as_ref()
            .map(|suite| suite.tests.join("|"))
            .unwrap_or_else(|| entry.name.clone());
        Self {
            cmd_line: test_cmd_line(entry, &filter, timeout),
            package_root: entry.execution.package_root.clone(),
            exec_env: entry.execution.env.clone(),
        }
    }
}

#[async_trait]
impl TestRunner for SuiteRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        env: &[(String, String)],
        output: &File,
    ) -> Result<(), RunnerError> {
        let dir = (!self.package_root.as_str().is_empty()).then_some(self.package_root.as_path());
        run_command(cancel, &self.cmd_line, dir, &self.exec_env, env, output).await
    }

    fn cmd_line(&self) -> String {
        self.cmd_line.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ExecutionConfig, RunConfig, SuiteConfig},
        model::collect_tests,
    };
    use std::sync::Arc;

    #[test]
    fn filter_joins_sub_tests() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig {
                name: "integration".to_owned(),
                command: "go test .".to_owned(),
                suites: vec![SuiteConfig {
                    name: "TestSuite".to_owned(),
                    tests: vec!["One".to_owned(), "Two".to_owned(), "Three".to_owned()],
                }],
                ..ExecutionConfig::default()
            })],
            ..RunConfig::default()
        };
        let (tests, _) = collect_tests(&config).unwrap();
        let runner = SuiteRunner::new(&tests[0], Duration::from_secs(60));
        assert!(runner.cmd_line().contains("\"^(One|Two|Three)$\""));
    }
}
