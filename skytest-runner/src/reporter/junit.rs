// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JUnit-style report model.
//!
//! Suites nest: the root "All tests" suite contains one suite per execution,
//! each containing one suite per cluster binding, plus a sibling "Cluster
//! failures" suite. Every suite and case carries its time in float seconds
//! and a human-readable time comment.

use crate::errors::ReportError;
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
use std::{io, time::Duration};

static TESTSUITES_TAG: &str = "testsuites";
static TESTSUITE_TAG: &str = "testsuite";
static TESTCASE_TAG: &str = "testcase";
static FAILURE_TAG: &str = "failure";
static SKIPPED_TAG: &str = "skipped";

/// The root element of a report.
#[derive(Clone, Debug, Default)]
pub struct Report {
    /// Top-level suites.
    pub suites: Vec<TestSuite>,
}

impl Report {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes this report to the given writer.
    pub fn serialize(&self, writer: impl io::Write) -> Result<(), ReportError> {
        let mut writer = Writer::new_with_indent(writer, b' ', 4);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new(TESTSUITES_TAG)))?;
        for suite in &self.suites {
            serialize_suite(suite, &mut writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(TESTSUITES_TAG)))?;
        // Trailing newline.
        writer.write_indent()?;
        Ok(())
    }

    /// Serializes this report to a string.
    pub fn to_xml(&self) -> Result<String, ReportError> {
        let mut buf = Vec::new();
        self.serialize(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Total failures over every suite, recursively.
    pub fn total_failures(&self) -> usize {
        self.suites.iter().map(TestSuite::total_failures).sum()
    }

    /// Total cases over every suite, recursively.
    pub fn total_tests(&self) -> usize {
        self.suites.iter().map(TestSuite::total_tests).sum()
    }
}

/// A suite: nested suites and/or test cases.
#[derive(Clone, Debug)]
pub struct TestSuite {
    /// Suite name.
    pub name: String,
    /// Number of cases attributed to this suite (including children).
    pub tests: usize,
    /// Number of failures attributed to this suite (including children).
    pub failures: usize,
    /// Time taken by this suite.
    pub time: Duration,
    /// Nested suites.
    pub suites: Vec<TestSuite>,
    /// The suite's own cases.
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    /// Creates an empty suite.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tests: 0,
            failures: 0,
            time: Duration::ZERO,
            suites: Vec::new(),
            cases: Vec::new(),
        }
    }

    fn total_failures(&self) -> usize {
        // The counters are rolled up by the aggregator; nested suites are
        // already included in the parent's number.
        self.failures
    }

    fn total_tests(&self) -> usize {
        self.tests
    }
}

/// A single test case.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Test name.
    pub name: String,
    /// Time taken by the case.
    pub time: Duration,
    /// The binding the case ran on, when known.
    pub cluster: Option<String>,
    /// Outcome.
    pub status: TestCaseStatus,
}

impl TestCase {
    /// Creates a case with the given status.
    pub fn new(name: impl Into<String>, status: TestCaseStatus) -> Self {
        Self {
            name: name.into(),
            time: Duration::ZERO,
            cluster: None,
            status,
        }
    }
}

/// Outcome of a test case.
#[derive(Clone, Debug)]
pub enum TestCaseStatus {
    /// The case passed.
    Success,
    /// The case failed.
    Failure(Failure),
    /// The case was skipped.
    Skipped(SkipMessage),
}

/// Details of a failed case.
#[derive(Clone, Debug)]
pub struct Failure {
    /// Short human-readable message.
    pub message: String,
    /// Concatenated attempt output.
    pub contents: String,
}

/// Details of a skipped case.
#[derive(Clone, Debug)]
pub struct SkipMessage {
    /// Why the case was skipped.
    pub message: String,
}

fn serialize_suite(
    suite: &TestSuite,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), ReportError> {
    let mut tag = BytesStart::new(TESTSUITE_TAG);
    tag.extend_attributes([
        ("name", suite.name.as_str()),
        ("tests", suite.tests.to_string().as_str()),
        ("failures", suite.failures.to_string().as_str()),
        ("time", suite.time.as_secs_f64().to_string().as_str()),
    ]);
    writer.write_event(Event::Start(tag))?;
    serialize_time_comment(suite.time, writer)?;

    for child in &suite.suites {
        serialize_suite(child, writer)?;
    }
    for case in &suite.cases {
        serialize_case(case, writer)?;
    }

    writer.write_event(Event::End(BytesEnd::new(TESTSUITE_TAG)))?;
    Ok(())
}

fn serialize_case(case: &TestCase, writer: &mut Writer<impl io::Write>) -> Result<(), ReportError> {
    let mut tag = BytesStart::new(TESTCASE_TAG);
    tag.push_attribute(("name", case.name.as_str()));
    tag.push_attribute(("time", case.time.as_secs_f64().to_string().as_str()));
    if let Some(cluster) = &case.cluster {
        tag.push_attribute(("cluster", cluster.as_str()));
    }
    writer.write_event(Event::Start(tag))?;
    serialize_time_comment(case.time, writer)?;

    match &case.status {
        TestCaseStatus::Success => {}
        TestCaseStatus::Failure(failure) => {
            let mut failure_tag = BytesStart::new(FAILURE_TAG);
            failure_tag.push_attribute(("type", "ERROR"));
            failure_tag.push_attribute(("message", failure.message.as_str()));
            writer.write_event(Event::Start(failure_tag))?;
            writer.write_event(Event::Text(BytesText::new(&failure.contents)))?;
            writer.write_event(Event::End(BytesEnd::new(FAILURE_TAG)))?;
        }
        TestCaseStatus::Skipped(skip) => {
            let mut skip_tag = BytesStart::new(SKIPPED_TAG);
            skip_tag.push_attribute(("message", skip.message.as_str()));
            writer.write_event(Event::Empty(skip_tag))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new(TESTCASE_TAG)))?;
    Ok(())
}

fn serialize_time_comment(
    time: Duration,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), ReportError> {
    let comment = format!(" Total time: {}s ", time.as_secs_f64().round());
    writer.write_event(Event::Comment(BytesText::new(&comment)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_suites_serialize() {
        let mut inner = TestSuite::new("group-a");
        inner.tests = 2;
        inner.failures = 1;
        inner.time = Duration::from_secs(3);
        inner.cases.push(TestCase::new("TestPass", TestCaseStatus::Success));
        inner.cases.push(TestCase::new(
            "TestFail",
            TestCaseStatus::Failure(Failure {
                message: "Test execution failed TestFail".to_owned(),
                contents: "boom & <bust>".to_owned(),
            }),
        ));

        let mut exec = TestSuite::new("integration");
        exec.tests = 2;
        exec.failures = 1;
        exec.suites.push(inner);

        let mut root = TestSuite::new("All tests");
        root.tests = 2;
        root.failures = 1;
        root.suites.push(exec);

        let report = Report { suites: vec![root] };
        let xml = report.to_xml().unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<testsuite name=\"All tests\" tests=\"2\" failures=\"1\""));
        assert!(xml.contains("<testsuite name=\"integration\""));
        assert!(xml.contains("<testsuite name=\"group-a\""));
        assert!(xml.contains("<failure type=\"ERROR\" message=\"Test execution failed TestFail\">"));
        // Text content must be escaped.
        assert!(xml.contains("boom &amp; &lt;bust&gt;"));
        assert_eq!(report.total_failures(), 1);
        assert_eq!(report.total_tests(), 2);
    }

    #[test]
    fn skipped_cases_carry_message() {
        let mut suite = TestSuite::new("All tests");
        suite.tests = 1;
        let mut case = TestCase::new(
            "TestSkipped",
            TestCaseStatus::Skipped(SkipMessage {
                message: "By limit of number of tests to run".to_owned(),
            }),
        );
        case.cluster = Some("a-1".to_owned());
        suite.cases.push(case);
        let report = Report { suites: vec![suite] };
        let xml = report.to_xml().unwrap();
        assert!(xml.contains("<skipped message=\"By limit of number of tests to run\"/>"));
        assert!(xml.contains("cluster=\"a-1\""));
    }
}
