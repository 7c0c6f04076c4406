// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Language-native test command runner.

use super::{run_command, TestRunner};
use crate::{errors::RunnerError, model::TestEntry};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::{fs::File, time::Duration};
use tokio_util::sync::CancellationToken;

/// Runs a single test through the execution's test command with name and tag
/// filters appended.
pub struct NativeTestRunner {
    cmd_line: String,
    package_root: Utf8PathBuf,
    exec_env: Vec<String>,
}

impl NativeTestRunner {
    /// Creates a runner for a native test entry. `timeout` is the effective
    /// attempt budget passed down to the test command.
    pub fn new(entry: &TestEntry, timeout: Duration) -> Self {
        Self {
            cmd_line: test_cmd_line(entry, &entry.name, timeout),
            package_root: entry.execution.package_root.clone(),
            exec_env: entry.execution.env.clone(),
        }
    }
}

#[async_trait]
impl TestRunner for NativeTestRunner {
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

/// Builds the filtered test command line shared by the native and suite
/// runners.
pub(super) fn test_cmd_line(entry: &TestEntry, run_filter: &str, timeout: Duration) -> String {
    format!(
        "{} -test.timeout {}s -count 1 --run \"^({})$\" --tags \"{}\" --test.v",
        entry.execution.command,
        timeout.as_secs(),
        run_filter,
        entry.tags,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ExecutionConfig, RunConfig},
        model::collect_tests,
    };
    use std::sync::Arc;

    #[test]
    fn cmd_line_carries_filters() {
        let config = RunConfig {
            executions: vec![Arc::new(ExecutionConfig {
                name: "integration".to_owned(),
                command: "go test .".to_owned(),
                tags: vec!["basic".to_owned(), "recover".to_owned()],
                tests: vec!["TestX".to_owned()],
                ..ExecutionConfig::default()
            })],
            ..RunConfig::default()
        };
        let (tests, _) = collect_tests(&config).unwrap();
        let runner = NativeTestRunner::new(&tests[0], Duration::from_secs(120));
        assert_eq!(
            runner.cmd_line(),
            "go test . -test.timeout 120s -count 1 --run \"^(TestX)$\" --tags \"basic,recover\" --test.v"
        );
    }
}
