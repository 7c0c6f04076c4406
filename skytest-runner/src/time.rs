// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run timing.
//!
//! The statistics printer needs three numbers: total elapsed time, time
//! with at least one ready cluster (no test can run earlier), and an ETA
//! extrapolated from the average completed-task time. [`RunClock`] keeps
//! the monotonic instants those are computed from, plus a wall-clock start
//! for the final summary line.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Timing state of one run.
#[derive(Clone, Debug)]
pub(crate) struct RunClock {
    started_at: DateTime<Local>,
    started: Instant,
    first_ready: Option<Instant>,
}

impl RunClock {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Local::now(),
            started: Instant::now(),
            first_ready: None,
        }
    }

    /// Wall-clock start time, for display.
    pub(crate) fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Total elapsed run time.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records that a cluster reached ready. Only the first call counts;
    /// later restarts do not move the mark.
    pub(crate) fn mark_cluster_ready(&mut self) {
        if self.first_ready.is_none() {
            self.first_ready = Some(Instant::now());
        }
    }

    /// Time spent with at least one ready cluster; zero while the fleet is
    /// still provisioning.
    pub(crate) fn running_elapsed(&self) -> Duration {
        self.first_ready
            .map(|ready| ready.elapsed())
            .unwrap_or_default()
    }

    /// ETA for `remaining` tasks, extrapolated from the average time per
    /// completed task. `None` until something has completed.
    pub(crate) fn estimate_remaining(&self, completed: usize, remaining: usize) -> Option<Duration> {
        if completed == 0 {
            return None;
        }
        Some(self.elapsed() / completed as u32 * remaining as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_advances() {
        let clock = RunClock::start();
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn first_ready_mark_is_kept() {
        let mut clock = RunClock::start();
        assert_eq!(clock.running_elapsed(), Duration::ZERO);

        clock.mark_cluster_ready();
        std::thread::sleep(Duration::from_millis(30));
        // A cluster restart reaching ready again must not reset the mark.
        clock.mark_cluster_ready();
        assert!(clock.running_elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn estimate_scales_the_average() {
        let clock = RunClock::start();
        assert!(clock.estimate_remaining(0, 5).is_none());

        std::thread::sleep(Duration::from_millis(40));
        // Two tasks took ~40ms together, so four more take at least twice
        // that.
        let estimate = clock.estimate_remaining(2, 4).unwrap();
        assert!(estimate >= Duration::from_millis(80));
        assert_eq!(clock.estimate_remaining(2, 0), Some(Duration::ZERO));
    }
}
