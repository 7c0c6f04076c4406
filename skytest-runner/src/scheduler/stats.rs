// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The statistics printer: periodic and final run summaries.

use super::imp::ExecutionContext;
use crate::model::TestStatus;
use std::fmt::Write as _;
use tracing::info;

impl ExecutionContext {
    /// Prints elapsed time, completed/remaining counts with an ETA,
    /// currently running tests, per-group fleet state and the status
    /// buckets of everything completed so far.
    pub(crate) fn print_statistics(&self) {
        let sched = self.sched.lock();
        let (elapsed, elapsed_running) = sched
            .clock
            .as_ref()
            .map(|clock| (clock.elapsed(), clock.running_elapsed()))
            .unwrap_or_default();

        let mut running = String::new();
        for task in sched.running.values() {
            let test = task.test.lock();
            let age = test
                .started
                .map(|started| started.elapsed())
                .unwrap_or_default();
            let binding = task.binding.lock();
            let _ = writeln!(
                running,
                "\t\t{} on {}, {}s",
                test.name,
                binding.cluster_task_id,
                age.as_secs()
            );
        }
        if !running.is_empty() {
            running = format!("\n\tRunning:\n{running}");
        }

        let mut clusters_msg = String::new();
        if !self.clusters.is_empty() {
            clusters_msg.push_str("\n\tClusters:\n");
        }
        for group in &self.clusters {
            let _ = writeln!(
                clusters_msg,
                "\t\tCluster: {} Tasks left: {}",
                group.config.name,
                group.tasks.lock().len()
            );
            for ci in &group.instances {
                let uptime = ci.inner.lock().start_time.elapsed();
                let _ = writeln!(
                    clusters_msg,
                    "\t\t\t{}: {}, uptime: {}s",
                    ci.id,
                    ci.display_state(),
                    uptime.as_secs()
                );
            }
        }

        let left = sched.pending.len() + sched.running.len();
        let remaining = sched
            .clock
            .as_ref()
            .and_then(|clock| clock.estimate_remaining(sched.completed.len(), left))
            .map(|eta| format!("{}s", eta.as_secs()))
            .unwrap_or_default();

        let mut success = 0;
        let mut failed = 0;
        // Tasks skipped at creation by the run-count cap never complete.
        let mut skipped = sched.skipped.len();
        let mut timeout = 0;
        let mut failed_names = String::new();
        for task in &sched.completed {
            let test = task.test.lock();
            match test.status {
                TestStatus::Success => success += 1,
                TestStatus::Timeout => timeout += 1,
                TestStatus::Skipped | TestStatus::SkippedNoClusters => skipped += 1,
                TestStatus::Failed => {
                    failed += 1;
                    let binding = task.binding.lock();
                    let _ = write!(failed_names, "\n\t\t{} on {}", test.name, binding.cluster_task_id);
                }
                TestStatus::Added | TestStatus::RerunRequest => {}
            }
        }

        info!(
            "Statistics:\n\tElapsed total: {}s\n\tTests time: {}s\n\tTasks  Completed: {}\n\t       Remaining: {} (~{})\n{}{}\n\tStatus  Passed: {}\n\tStatus  Failed: {}{}\n\tStatus  Timeout: {}\n\tStatus  Skipped: {}",
            elapsed.as_secs(),
            elapsed_running.as_secs(),
            sched.completed.len(),
            left,
            remaining,
            running,
            clusters_msg,
            success,
            failed,
            failed_names,
            timeout,
            skipped,
        );
    }
}
