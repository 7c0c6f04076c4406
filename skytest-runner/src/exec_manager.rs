// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Artifact storage for a run: per-binding folders and attempt output files.

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use std::{collections::HashMap, fs::File, io};
use tracing::warn;

/// Storage service for run artifacts. The scheduler and providers only talk
/// to this trait; the filesystem layout is an implementation detail.
pub trait ExecutionManager: Send + Sync {
    /// Allocates an artifact directory for one attempt of a test on a
    /// binding.
    fn add_folder(&self, cluster_task_id: &str, test_name: &str) -> Utf8PathBuf;

    /// Opens the output file for one phase of a test attempt. Returns the
    /// file's path along with the open handle.
    fn open_test_file(
        &self,
        cluster_task_id: &str,
        test_name: &str,
        phase: &str,
    ) -> io::Result<(Utf8PathBuf, File)>;

    /// Writes a named file under the artifact root.
    fn add_file(&self, name: &Utf8Path, content: &[u8]) -> io::Result<Utf8PathBuf>;

    /// A dedicated directory under the artifact root for the given key.
    fn root_for(&self, key: &str) -> io::Result<Utf8PathBuf>;
}

/// Filesystem-backed [`ExecutionManager`]. Attempts are numbered per
/// binding so repeated attempts of the same test do not collide.
pub struct FsExecutionManager {
    root: Utf8PathBuf,
    steps: Mutex<HashMap<String, usize>>,
}

impl FsExecutionManager {
    /// Creates a manager rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            steps: Mutex::new(HashMap::new()),
        }
    }

    fn next_step(&self, cluster_task_id: &str) -> usize {
        let mut steps = self.steps.lock();
        let step = steps.entry(cluster_task_id.to_owned()).or_insert(0);
        *step += 1;
        *step
    }
}

impl ExecutionManager for FsExecutionManager {
    fn add_folder(&self, cluster_task_id: &str, test_name: &str) -> Utf8PathBuf {
        let step = self.next_step(cluster_task_id);
        let path = self
            .root
            .join(cluster_task_id)
            .join(format!("{step:03}-{test_name}"));
        if let Err(error) = std::fs::create_dir_all(&path) {
            warn!("failed to create artifact folder {path}: {error}");
        }
        path
    }

    fn open_test_file(
        &self,
        cluster_task_id: &str,
        test_name: &str,
        phase: &str,
    ) -> io::Result<(Utf8PathBuf, File)> {
        let step = self.next_step(cluster_task_id);
        let dir = self.root.join(cluster_task_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{step:03}-{test_name}-{phase}.log"));
        let file = File::create(&path)?;
        Ok((path, file))
    }

    fn add_file(&self, name: &Utf8Path, content: &[u8]) -> io::Result<Utf8PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    fn root_for(&self, key: &str) -> io::Result<Utf8PathBuf> {
        let path = self.root.join(key);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, FsExecutionManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, FsExecutionManager::new(root))
    }

    #[test]
    fn folders_are_numbered_per_binding() {
        let (_dir, manager) = manager();
        let first = manager.add_folder("a_b", "TestX");
        let second = manager.add_folder("a_b", "TestX");
        let other = manager.add_folder("c", "TestX");
        assert!(first.as_str().ends_with("001-TestX"));
        assert!(second.as_str().ends_with("002-TestX"));
        assert!(other.as_str().ends_with("001-TestX"));
        assert!(first.is_dir());
    }

    #[test]
    fn test_files_are_created() {
        let (_dir, manager) = manager();
        let (path, _file) = manager.open_test_file("a", "TestX", "run").unwrap();
        assert!(path.as_str().ends_with("001-TestX-run.log"));
        assert!(path.is_file());
    }

    #[test]
    fn add_file_writes_under_root() {
        let (_dir, manager) = manager();
        let path = manager
            .add_file(Utf8Path::new("results/junit.xml"), b"<xml/>")
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"<xml/>");
    }
}
