// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner adapters: a uniform contract over subprocess-backed test runners.
//!
//! Three kinds exist: shell scripts, single tests through a language-native
//! test command, and suite slices. Runners are opaque to the scheduler; the
//! supervisor only calls [`TestRunner::run`] and captures output.

mod native;
mod shell;
mod suite;

pub use native::NativeTestRunner;
pub use shell::ShellRunner;
pub use suite::SuiteRunner;

use crate::{
    errors::RunnerError,
    model::{TestEntry, TestKind},
};
use async_trait::async_trait;
use camino::Utf8Path;
use std::{fs::File, process::Stdio, time::Duration};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;


/// Runs one test attempt against the bound clusters.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Executes the attempt. Output goes to `output`; `env` carries the
    /// per-cluster config variables and the artifacts directory.
    async fn run(
        &self,
        cancel: &CancellationToken,
        env: &[(String, String)],
        output: &File,
    ) -> Result<(), RunnerError>;

    /// The command line, for logging.
    fn cmd_line(&self) -> String;
}

/// Picks a runner for the entry's kind.
pub fn make_runner(entry: &TestEntry, timeout: Duration) -> Box<dyn TestRunner> {
    match entry.kind {
        TestKind::Shell => Box::new(ShellRunner::new(entry)),
        TestKind::Native => Box::new(NativeTestRunner::new(entry, timeout)),
        TestKind::Suite => Box::new(SuiteRunner::new(entry, timeout)),
    }
}

/// Runs `cmd_line` through `sh -c`, wiring stdout and stderr to `output`.
/// The child is killed when `cancel` fires.
pub(crate) async fn run_command(
    cancel: &CancellationToken,
    cmd_line: &str,
    dir: Option<&Utf8Path>,
    exec_env: &[String],
    env: &[(String, String)],
    output: &File,
) -> Result<(), RunnerError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(cmd_line)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output.try_clone()?))
        .stderr(Stdio::from(output.try_clone()?))
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for entry in exec_env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|error| RunnerError::Spawn {
        cmd: cmd_line.to_owned(),
        error,
    })?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(RunnerError::Failed {
                    cmd: cmd_line.to_owned(),
                    status,
                })
            }
        }
        _ = cancel.cancelled() => {
            child.start_kill().ok();
            child.wait().await.ok();
            Err(RunnerError::Cancelled {
                cmd: cmd_line.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn output_file() -> (tempfile::TempDir, std::path::PathBuf, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = File::create(&path).unwrap();
        (dir, path, file)
    }

    #[tokio::test]
    async fn run_command_captures_output() {
        let (_dir, path, file) = output_file();
        let cancel = CancellationToken::new();
        run_command(&cancel, "echo captured", None, &[], &[], &file)
            .await
            .unwrap();
        let mut contents = String::new();
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("captured"));
    }

    #[tokio::test]
    async fn run_command_reports_exit_status() {
        let (_dir, _path, file) = output_file();
        let cancel = CancellationToken::new();
        let err = run_command(&cancel, "exit 7", None, &[], &[], &file)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Failed { .. }));
    }

    #[tokio::test]
    async fn run_command_passes_env() {
        let (_dir, path, file) = output_file();
        let cancel = CancellationToken::new();
        run_command(
            &cancel,
            "echo value=$MARKER other=$EXTRA",
            None,
            &["EXTRA=fromexec".to_owned()],
            &[("MARKER".to_owned(), "frompair".to_owned())],
            &file,
        )
        .await
        .unwrap();
        let mut contents = String::new();
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("value=frompair"));
        assert!(contents.contains("other=fromexec"));
    }

    #[tokio::test]
    async fn run_command_is_cancellable() {
        let (_dir, _path, file) = output_file();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = run_command(&cancel, "sleep 30", None, &[], &[], &file)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
