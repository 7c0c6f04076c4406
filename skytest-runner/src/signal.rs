// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OS termination signals.
//!
//! A signal is just one more reason for a run to stop, so the watchers
//! installed here feed the same termination channel as failing health
//! checks and the failed-tests limit. The scheduler loop never sees the
//! signal itself, only the fatal error it turns into.

use crate::errors::RunError;
use std::io;
use tokio::sync::mpsc;
use tracing::info;

/// How a run reacts to OS termination signals.
///
/// Passed into [`perform_testing`](crate::perform_testing).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SignalMode {
    /// End the run on SIGINT, SIGTERM, SIGHUP or SIGQUIT (Ctrl-C on
    /// Windows), shutting every cluster down.
    Terminate,
    /// Leave signals alone. Useful for tests.
    Ignore,
}

/// Installs the signal watchers for `mode`. The first delivered signal is
/// forwarded onto the termination channel; once the loop has exited,
/// further deliveries go nowhere.
pub(crate) fn spawn_signal_watchers(
    mode: SignalMode,
    term_tx: mpsc::Sender<RunError>,
) -> io::Result<()> {
    match mode {
        SignalMode::Terminate => imp::spawn(term_tx),
        SignalMode::Ignore => Ok(()),
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{signal, SignalKind};

    pub(super) fn spawn(term_tx: mpsc::Sender<RunError>) -> io::Result<()> {
        let kinds = [
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::hangup(), "SIGHUP"),
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::quit(), "SIGQUIT"),
        ];
        for (kind, name) in kinds {
            let mut stream = signal(kind)?;
            let term_tx = term_tx.clone();
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    info!("received {name}, stopping the run");
                    let _ = term_tx.send(RunError::Terminated).await;
                }
            });
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use super::*;

    pub(super) fn spawn(term_tx: mpsc::Sender<RunError>) -> io::Result<()> {
        let mut ctrl_c = tokio::signal::windows::ctrl_c()?;
        tokio::spawn(async move {
            if ctrl_c.recv().await.is_some() {
                info!("received Ctrl-C, stopping the run");
                let _ = term_tx.send(RunError::Terminated).await;
            }
        });
        Ok(())
    }
}
