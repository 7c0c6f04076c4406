// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shell script test runner.

use super::{run_command, TestRunner};
use crate::{errors::RunnerError, model::TestEntry};
use async_trait::async_trait;
use std::{fs::File, io::Write};
use tokio_util::sync::CancellationToken;

/// Runs the execution's shell script, one command line at a time.
pub struct ShellRunner {
    script: String,
    exec_env: Vec<String>,
}

impl ShellRunner {
    /// Creates a runner for a shell entry.
    pub fn new(entry: &TestEntry) -> Self {
        Self {
            script: entry.run_script.clone().unwrap_or_default(),
            exec_env: entry.execution.env.clone(),
        }
    }
}

#[async_trait]
impl TestRunner for ShellRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        env: &[(String, String)],
        output: &File,
    ) -> Result<(), RunnerError> {
        for line in self.script.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            writeln!(&mut &*output, ">>>>>>Running: {line}:<<<<<<")?;
            run_command(cancel, line, None, &self.exec_env, env, output).await?;
        }
        Ok(())
    }

    fn cmd_line(&self) -> String {
        self.script.clone()
    }
}
