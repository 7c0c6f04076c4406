// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operation events flowing from workers back to the scheduler loop.

use super::{cluster::ClusterInstance, imp::TestTask};
use std::sync::Arc;

/// An event on the operation channel. Every state transition the main loop
/// reacts to arrives as one of these.
#[derive(Clone)]
pub(crate) enum OperationEvent {
    /// A cluster instance changed state.
    ClusterUpdate(Arc<ClusterInstance>),
    /// A task finished an attempt (terminal or transitional).
    TaskUpdate(Arc<TestTask>),
}
