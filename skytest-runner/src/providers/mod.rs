// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider traits: how the engine provisions and observes clusters.
//!
//! The scheduler never talks to a cloud directly. A [`ClusterProvider`]
//! creates [`ClusterHandle`]s, and the engine drives those handles through
//! start, liveness and destroy. Providers are registered by kind; group
//! configs select one by their `kind` field.

pub mod shell;

use crate::{config::ClusterGroupConfig, errors::ProviderError, exec_manager::ExecutionManager};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Instance operation parameters carried from the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct InstanceOptions {
    /// Skip stop operations on shutdown.
    pub no_stop: bool,
    /// Skip install operations.
    pub no_install: bool,
    /// Skip prepare operations.
    pub no_prepare: bool,
    /// Disable masking of environment variables in output.
    pub no_mask: bool,
}

/// A failed start, carrying the provisioning log when one was produced.
#[derive(Debug)]
pub struct StartFailure {
    /// The provisioning log file, if any was written.
    pub log_file: Option<Utf8PathBuf>,
    /// The underlying error.
    pub error: ProviderError,
}

/// One provisioned cluster slot.
///
/// Some clusters may be alive by default (bare metal), in which case start
/// and destroy are cheap no-ops for the provider.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// A stable identifier for this slot.
    fn id(&self) -> String;

    /// Root folder for artifacts associated with this cluster.
    fn root(&self) -> Utf8PathBuf;

    /// The cluster's config file location (e.g. a kubeconfig).
    async fn cluster_config(&self) -> Result<Utf8PathBuf, ProviderError>;

    /// Provisions the cluster. Returns the provisioning log path.
    async fn start(&self, timeout: Duration) -> Result<Utf8PathBuf, StartFailure>;

    /// Destroys the cluster. Must respect the timeout.
    async fn destroy(&self, timeout: Duration) -> Result<(), ProviderError>;

    /// Whether the cluster is currently provisioned.
    fn is_running(&self) -> bool;

    /// Liveness probe.
    async fn check_alive(&self) -> Result<(), ProviderError>;
}

/// Creates and cleans up clusters for one group config.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Creates one cluster slot for the group.
    async fn create_cluster(
        &self,
        config: &ClusterGroupConfig,
        manager: Arc<dyn ExecutionManager>,
        options: &InstanceOptions,
    ) -> Result<Arc<dyn ClusterHandle>, ProviderError>;

    /// Checks that the group config carries everything this provider needs.
    fn validate_config(&self, config: &ClusterGroupConfig) -> Result<(), ProviderError>;

    /// One-shot pre-run cleanup of leaked clusters.
    async fn cleanup_clusters(
        &self,
        config: &ClusterGroupConfig,
        manager: Arc<dyn ExecutionManager>,
        options: &InstanceOptions,
    );
}

/// Providers by kind.
pub type ProviderRegistry = HashMap<String, Arc<dyn ClusterProvider>>;

/// The built-in registry: the script-backed `shell` provider.
pub fn default_registry(
    manager: &Arc<dyn ExecutionManager>,
) -> Result<ProviderRegistry, std::io::Error> {
    let mut registry: ProviderRegistry = HashMap::new();
    let root = manager.root_for("shell")?;
    registry.insert(
        "shell".to_owned(),
        Arc::new(shell::ShellClusterProvider::new(root)),
    );
    Ok(registry)
}
