// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by skytest.

use camino::Utf8PathBuf;
use std::io;

/// An error that occurred while loading or merging configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file `{path}`")]
    Read {
        /// The file that failed to read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file `{path}`")]
    Parse {
        /// The file that failed to parse.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_yaml::Error,
    },

    /// An `imports` entry used an invalid file-name pattern.
    #[error("invalid import pattern `{pattern}`")]
    ImportPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying error.
        #[source]
        error: regex::Error,
    },

    /// A `retest-config` pattern failed to compile.
    #[error("invalid restart pattern `{pattern}`")]
    RestartPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying error.
        #[source]
        error: regex::Error,
    },

    /// An execution was declared without a name.
    #[error("execution name should be specified")]
    MissingExecutionName,

    /// No tests were produced by any execution.
    #[error("there are no tests defined")]
    NoTests,

    /// No enabled cluster group survived filtering.
    #[error("there are no clusters defined")]
    NoClusters,

    /// Fleet sizing produced zero instances for an enabled group.
    #[error("no instances are specified for {group}")]
    NoInstances {
        /// The group with an empty fleet.
        group: String,
    },

    /// A group config referenced a provider kind with no registered factory.
    #[error("cluster provider `{kind}` not found")]
    ProviderNotFound {
        /// The provider kind.
        kind: String,
    },
}

/// A fatal condition that terminates the scheduler loop, or a failure to set
/// the run up.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    /// Configuration or test collection failed before the loop started.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The provider artifact root could not be prepared.
    #[error("failed to prepare provider root")]
    ProviderRoot {
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A provider failed while creating cluster instances.
    #[error("failed to create cluster instance for group `{group}`")]
    CreateCluster {
        /// The group whose instance creation failed.
        group: String,
        /// The underlying error.
        #[source]
        error: ProviderError,
    },

    /// An OS termination signal was received.
    #[error("termination request is received")]
    Terminated,

    /// The global run deadline elapsed.
    #[error("global timeout elapsed: {seconds} seconds")]
    GlobalTimeout {
        /// The configured timeout.
        seconds: u64,
    },

    /// The configured limit for failed tests was reached.
    #[error("allowed limit for failed tests is reached: {limit}")]
    FailedTestsLimit {
        /// The configured limit.
        limit: u32,
    },

    /// A configured health check reported a failure.
    #[error("health check `{name}` failed: {message}")]
    HealthCheck {
        /// The health check name.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The signal handler could not be installed.
    #[error("failed to set up signal handler")]
    SignalSetup {
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The report could not be written.
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// An error preparing a task for dispatch.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// Artifact files could not be created.
    #[error("failed to open attempt output")]
    Io(#[from] io::Error),

    /// A bound instance could not report its cluster config.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// An error produced by a cluster provider or instance handle.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The group configuration is not valid for this provider.
    #[error("invalid cluster config: {message}")]
    InvalidConfig {
        /// What is wrong with the config.
        message: String,
    },

    /// A provisioning script or API call failed.
    #[error("cluster operation `{operation}` failed: {message}")]
    OperationFailed {
        /// The operation that failed (start, destroy, ...).
        operation: String,
        /// What went wrong.
        message: String,
    },

    /// The cluster did not respond to a liveness probe.
    #[error("cluster is not alive: {message}")]
    NotAlive {
        /// What went wrong.
        message: String,
    },

    /// An I/O error while managing instance state on disk.
    #[error("provider i/o error")]
    Io(#[from] io::Error),
}

/// An error produced while executing a test attempt or a hook script.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The child process could not be spawned.
    #[error("failed to start `{cmd}`")]
    Spawn {
        /// The command line.
        cmd: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The child process exited with a non-zero status.
    #[error("`{cmd}` exited with {status}")]
    Failed {
        /// The command line.
        cmd: String,
        /// The exit status.
        status: std::process::ExitStatus,
    },

    /// The attempt was cancelled or timed out.
    #[error("`{cmd}` was cancelled")]
    Cancelled {
        /// The command line.
        cmd: String,
    },

    /// An I/O error while wiring up process output.
    #[error("runner i/o error")]
    Io(#[from] io::Error),

    /// One or more lines of a hook script failed.
    #[error("error(s) from '{name}' script: {errors}")]
    Hook {
        /// The hook name (Before, After, OnFail).
        name: String,
        /// Joined per-line errors.
        errors: String,
    },

    /// A follow-up script failed after the test itself failed.
    #[error("{source}; on-fail script: {on_fail}")]
    OnFail {
        /// The original test failure.
        #[source]
        source: Box<RunnerError>,
        /// The on-fail script error.
        on_fail: String,
    },
}

/// An error while serializing or writing the report file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReportError {
    /// XML serialization failed.
    #[error("failed to serialize report")]
    Serialize(#[from] quick_xml::Error),

    /// An I/O error while serializing the report.
    #[error("i/o error while serializing report")]
    Io(#[from] io::Error),

    /// The report file could not be written.
    #[error("failed to write report file `{path}`")]
    Write {
        /// The target path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}
