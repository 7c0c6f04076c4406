// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The script-backed cluster provider.
//!
//! A `shell` group declares `scripts.{start,destroy,alive,cleanup}`; each
//! instance gets its own directory under the provider root, and every script
//! runs with `CLUSTER_ID` and `CLUSTER_ROOT` set alongside the group's env.

use crate::{
    config::{ClusterGroupConfig, ProviderScripts},
    errors::ProviderError,
    exec_manager::ExecutionManager,
    providers::{ClusterHandle, ClusterProvider, InstanceOptions, StartFailure},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::process::Command;
use tracing::{info, warn};

/// Creates script-backed cluster instances.
pub struct ShellClusterProvider {
    root: Utf8PathBuf,
    next_index: Mutex<HashMap<String, usize>>,
}

impl ShellClusterProvider {
    /// Creates a provider rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_index: Mutex::new(HashMap::new()),
        }
    }

    fn next_index(&self, group: &str) -> usize {
        let mut indices = self.next_index.lock();
        let index = indices.entry(group.to_owned()).or_insert(0);
        *index += 1;
        *index
    }
}

#[async_trait]
impl ClusterProvider for ShellClusterProvider {
    async fn create_cluster(
        &self,
        config: &ClusterGroupConfig,
        _manager: Arc<dyn ExecutionManager>,
        _options: &InstanceOptions,
    ) -> Result<Arc<dyn ClusterHandle>, ProviderError> {
        self.validate_config(config)?;
        let index = self.next_index(&config.name);
        let id = format!("{}-{}", config.name, index);
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(ShellClusterHandle {
            id,
            dir,
            scripts: config.scripts.clone(),
            env: config.env.clone(),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }))
    }

    fn validate_config(&self, config: &ClusterGroupConfig) -> Result<(), ProviderError> {
        if config.scripts.start.trim().is_empty() {
            return Err(ProviderError::InvalidConfig {
                message: format!("group '{}' has no start script", config.name),
            });
        }
        if config.scripts.destroy.trim().is_empty() {
            return Err(ProviderError::InvalidConfig {
                message: format!("group '{}' has no destroy script", config.name),
            });
        }
        Ok(())
    }

    async fn cleanup_clusters(
        &self,
        config: &ClusterGroupConfig,
        _manager: Arc<dyn ExecutionManager>,
        _options: &InstanceOptions,
    ) {
        if config.scripts.cleanup.trim().is_empty() {
            return;
        }
        info!("running cleanup for cluster group {}", config.name);
        let log = self.root.join(format!("{}-cleanup.log", config.name));
        if let Err(error) = run_script(
            &config.scripts.cleanup,
            &self.root,
            &config.env,
            &[("CLUSTER_ROOT", self.root.as_str())],
            &log,
            Duration::from_secs(600),
        )
        .await
        {
            warn!("cleanup for group {} failed: {error}", config.name);
        }
    }
}

struct ShellClusterHandle {
    id: String,
    dir: Utf8PathBuf,
    scripts: ProviderScripts,
    env: Vec<String>,
    running: AtomicBool,
    starts: AtomicUsize,
}

impl ShellClusterHandle {
    fn instance_env(&self) -> [(&str, &str); 2] {
        [("CLUSTER_ID", self.id.as_str()), ("CLUSTER_ROOT", self.dir.as_str())]
    }
}

#[async_trait]
impl ClusterHandle for ShellClusterHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn root(&self) -> Utf8PathBuf {
        self.dir.clone()
    }

    async fn cluster_config(&self) -> Result<Utf8PathBuf, ProviderError> {
        let location = if self.scripts.config_location.as_str().is_empty() {
            Utf8Path::new("config")
        } else {
            self.scripts.config_location.as_path()
        };
        let path = self.dir.join(location);
        if !path.is_file() {
            return Err(ProviderError::OperationFailed {
                operation: "cluster-config".to_owned(),
                message: format!("cluster config {path} does not exist"),
            });
        }
        Ok(path)
    }

    async fn start(&self, timeout: Duration) -> Result<Utf8PathBuf, StartFailure> {
        let attempt = self.starts.fetch_add(1, Ordering::Relaxed) + 1;
        let log = self.dir.join(format!("start-{attempt}.log"));
        match run_script(
            &self.scripts.start,
            &self.dir,
            &self.env,
            &self.instance_env(),
            &log,
            timeout,
        )
        .await
        {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                Ok(log)
            }
            Err(error) => Err(StartFailure {
                log_file: Some(log),
                error,
            }),
        }
    }

    async fn destroy(&self, timeout: Duration) -> Result<(), ProviderError> {
        self.running.store(false, Ordering::Release);
        let log = self.dir.join("destroy.log");
        run_script(
            &self.scripts.destroy,
            &self.dir,
            &self.env,
            &self.instance_env(),
            &log,
            timeout,
        )
        .await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn check_alive(&self) -> Result<(), ProviderError> {
        if !self.is_running() {
            return Err(ProviderError::NotAlive {
                message: format!("cluster {} is not started", self.id),
            });
        }
        if self.scripts.alive.trim().is_empty() {
            return Ok(());
        }
        let log = self.dir.join("alive.log");
        run_script(
            &self.scripts.alive,
            &self.dir,
            &self.env,
            &self.instance_env(),
            &log,
            Duration::from_secs(60),
        )
        .await
        .map_err(|error| ProviderError::NotAlive {
            message: error.to_string(),
        })
    }
}

async fn run_script(
    script: &str,
    dir: &Utf8Path,
    group_env: &[String],
    instance_env: &[(&str, &str)],
    log: &Utf8Path,
    timeout: Duration,
) -> Result<(), ProviderError> {
    let log_file = std::fs::File::create(log)?;
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        .kill_on_drop(true);
    for entry in group_env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    for (key, value) in instance_env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|error| ProviderError::OperationFailed {
        operation: "spawn".to_owned(),
        message: format!("failed to start script: {error}"),
    })?;

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            child.start_kill().ok();
            child.wait().await.ok();
            return Err(ProviderError::OperationFailed {
                operation: "script".to_owned(),
                message: format!("script did not finish within {timeout:?}"),
            });
        }
    };
    if !status.success() {
        return Err(ProviderError::OperationFailed {
            operation: "script".to_owned(),
            message: format!("script exited with {status}, log: {log}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_manager::FsExecutionManager;

    fn group(start: &str, destroy: &str) -> ClusterGroupConfig {
        ClusterGroupConfig {
            name: "local".to_owned(),
            kind: "shell".to_owned(),
            instances: 1,
            scripts: ProviderScripts {
                start: start.to_owned(),
                destroy: destroy.to_owned(),
                config_location: Utf8PathBuf::from("config"),
                ..ProviderScripts::default()
            },
            ..ClusterGroupConfig::default()
        }
    }

    fn manager(root: &Utf8Path) -> Arc<dyn ExecutionManager> {
        Arc::new(FsExecutionManager::new(root.to_owned()))
    }

    #[tokio::test]
    async fn start_produces_config_and_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let provider = ShellClusterProvider::new(root.clone());
        let config = group("echo kube > $CLUSTER_ROOT/config", "true");

        let handle = provider
            .create_cluster(&config, manager(&root), &InstanceOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.id(), "local-1");

        assert!(handle.check_alive().await.is_err());
        handle.start(Duration::from_secs(30)).await.unwrap();
        assert!(handle.is_running());
        handle.check_alive().await.unwrap();
        let kubeconfig = handle.cluster_config().await.unwrap();
        assert!(kubeconfig.is_file());

        handle.destroy(Duration::from_secs(30)).await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn failing_start_reports_log() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let provider = ShellClusterProvider::new(root.clone());
        let config = group("echo provisioning failed; exit 3", "true");

        let handle = provider
            .create_cluster(&config, manager(&root), &InstanceOptions::default())
            .await
            .unwrap();
        let failure = handle.start(Duration::from_secs(30)).await.unwrap_err();
        let log = failure.log_file.unwrap();
        let contents = std::fs::read_to_string(log).unwrap();
        assert!(contents.contains("provisioning failed"));
        assert!(!handle.is_running());
    }

    #[test]
    fn missing_scripts_fail_validation() {
        let provider = ShellClusterProvider::new("unused");
        let mut config = group("", "true");
        assert!(provider.validate_config(&config).is_err());
        config.scripts.start = "true".to_owned();
        config.scripts.destroy = String::new();
        assert!(provider.validate_config(&config).is_err());
        config.scripts.destroy = "true".to_owned();
        provider.validate_config(&config).unwrap();
    }
}
