// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report generation: the JUnit-style report model and the aggregator that
//! builds it from completed tasks.

mod aggregator;
pub mod junit;

pub use junit::{Failure, Report, SkipMessage, TestCase, TestCaseStatus, TestSuite};
