// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The execution engine: an event-driven scheduler that matches test tasks
//! to cluster instances, drives instances through their lifecycle and
//! supervises per-task execution.
//!
//! The main loop is single-threaded: it assigns pending tasks, shuts down
//! idle fleets and then blocks on the next operation event, OS signal,
//! global deadline, health-check failure or statistics tick. Cluster
//! starters, health monitors and task supervisors run as spawned tasks and
//! report back through the operation channel.

pub(crate) mod cluster;
pub(crate) mod events;
pub(crate) mod imp;
mod scripts;
mod stats;
pub(crate) mod supervisor;

pub use imp::{perform_testing, Arguments, RunOutcome};
