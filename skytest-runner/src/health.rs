// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic health checks: scripts whose failure terminates the run.

use crate::{errors::RunError, scheduler::imp::ExecutionContext};
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::process::Command;
use tracing::info;

/// Spawns one probe loop per configured health check. A failing probe
/// pushes a fatal error onto the termination channel and the loop exits.
pub(crate) fn start_health_checks(ctx: &Arc<ExecutionContext>) {
    for check in &ctx.config.health_check {
        if check.run.trim().is_empty() {
            continue;
        }
        let name = if check.name.is_empty() {
            check.run.clone()
        } else {
            check.name.clone()
        };
        let run = check.run.clone();
        let interval = Duration::from_secs(check.interval.max(1));
        let term_tx = ctx.term_tx.clone();
        info!("starting health check '{name}' every {interval:?}");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match probe(&run).await {
                    Ok(()) => {}
                    Err(message) => {
                        let _ = term_tx
                            .send(RunError::HealthCheck { name, message })
                            .await;
                        return;
                    }
                }
            }
        });
    }
}

async fn probe(run: &str) -> Result<(), String> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(run)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| format!("failed to start probe: {error}"))?;
    let status = child
        .wait()
        .await
        .map_err(|error| format!("failed to wait for probe: {error}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("probe exited with {status}"))
    }
}
