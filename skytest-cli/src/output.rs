// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logging setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Installs the tracing subscriber: `SKYTEST_LOG` controls the filter,
/// defaulting to `info`.
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_env("SKYTEST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
