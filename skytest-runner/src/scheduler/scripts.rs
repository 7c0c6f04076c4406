// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook script execution: before, after and on-fail scripts.

use crate::{errors::RunnerError, runners::run_command};
use std::{fs::File, io::Write, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Hooks may not run longer than this.
const HOOK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Runs a hook script: each non-blank line through the shell, sharing the
/// attempt's output writer. Lines keep running after a failure; the
/// combined errors are reported at the end.
pub(crate) async fn run_hook(
    name: &str,
    script: &str,
    exec_env: &[String],
    env: &[(String, String)],
    output: &File,
) -> Result<(), RunnerError> {
    if script.trim().is_empty() {
        writeln!(&mut &*output, "{name} is empty script. Nothing to run")?;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut errors = Vec::new();
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let run = run_command(&cancel, line, None, exec_env, env, output);
        let result = match tokio::time::timeout(HOOK_TIMEOUT, run).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Cancelled {
                cmd: line.to_owned(),
            }),
        };
        if let Err(err) = result {
            error!("an error during run cmd: {line}, err: {err}");
            errors.push(err.to_string());
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::Hook {
            name: name.to_owned(),
            errors: errors.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn output() -> (tempfile::TempDir, std::path::PathBuf, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.log");
        let file = File::create(&path).unwrap();
        (dir, path, file)
    }

    #[tokio::test]
    async fn empty_script_is_a_noop() {
        let (_dir, path, file) = output();
        run_hook("Before", "  \n ", &[], &[], &file).await.unwrap();
        let mut contents = String::new();
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("Before is empty script"));
    }

    #[tokio::test]
    async fn failing_line_does_not_stop_later_lines() {
        let (_dir, path, file) = output();
        let err = run_hook("After", "false\necho still-ran", &[], &[], &file)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Hook { .. }));
        let mut contents = String::new();
        File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("still-ran"));
    }
}
