//! Test handles, reports and the suite runner.
//!
//! [`TestHandle`] is what hooks and steps receive to report their outcome.
//! It mirrors the usual test primitives: `log`, `error` (fail and continue),
//! `fatal` (fail and stop), `skip`, and named subtests via [`TestHandle::run`].
//! Every handle turns into a [`TestReport`] when it finishes, so a whole run
//! can be inspected after the fact.
//!
//! [`TestSuite`] is the top-level runner handed to
//! [`Environment::run`](crate::env::Environment::run): it owns named test
//! functions, runs the ones selected by its filter and reduces the result to
//! a process exit code.

use crate::env::Environment;
use crate::envconf::ConfigError;
use regex::Regex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terminal state of a test or subtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Passed => "PASS",
            Outcome::Failed => "FAIL",
            Outcome::Skipped => "SKIP",
        };
        f.write_str(label)
    }
}

/// Result of one test and its subtests.
#[derive(Debug, Clone)]
pub struct TestReport {
    /// Full name, with subtests separated by `/`.
    pub name: String,
    pub outcome: Outcome,
    pub messages: Vec<String>,
    pub duration: Duration,
    pub children: Vec<TestReport>,
}

impl TestReport {
    /// Find a report in this tree by its full name.
    pub fn find(&self, name: &str) -> Option<&TestReport> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Count reports in this tree (including this one) with `outcome`.
    pub fn count(&self, outcome: Outcome) -> usize {
        let own = usize::from(self.outcome == outcome);
        own + self.children.iter().map(|c| c.count(outcome)).sum::<usize>()
    }

    /// Render the tree in the familiar `--- PASS: name (0.00s)` layout.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        out.push_str(&format!(
            "{indent}--- {}: {} ({:.2}s)\n",
            self.outcome,
            self.name,
            self.duration.as_secs_f64()
        ));
        for message in &self.messages {
            out.push_str(&format!("{indent}    {message}\n"));
        }
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

/// Handle for the running test.
#[derive(Debug)]
pub struct TestHandle {
    name: String,
    failed: bool,
    skipped: bool,
    halted: bool,
    messages: Vec<String>,
    children: Vec<TestReport>,
    started: Instant,
}

impl TestHandle {
    /// Start a top-level test.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failed: false,
            skipped: false,
            halted: false,
            messages: Vec::new(),
            children: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Full name of this test.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record an informational message.
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "e2e.test", test = %self.name, "{message}");
        self.messages.push(message);
    }

    /// Mark the test failed and keep going.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "e2e.test", test = %self.name, "{message}");
        self.messages.push(message);
        self.failed = true;
    }

    /// Mark the test failed and stop its remaining work.
    pub fn fatal(&mut self, message: impl Into<String>) {
        self.error(message);
        self.halted = true;
    }

    /// Mark the test failed without a message.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Mark the test skipped and stop its remaining work.
    pub fn skip(&mut self, message: impl Into<String>) {
        self.log(message);
        self.skipped = true;
        self.halted = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn skipped(&self) -> bool {
        self.skipped
    }

    /// True after `fatal` or `skip`; callers should stop issuing work.
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn outcome(&self) -> Outcome {
        if self.failed {
            Outcome::Failed
        } else if self.skipped {
            Outcome::Skipped
        } else {
            Outcome::Passed
        }
    }

    /// Run `f` as a named subtest.
    ///
    /// Returns `false` if the subtest failed, in which case this test is
    /// marked failed as well. A skipped subtest does not affect the parent.
    pub fn run<F>(&mut self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut TestHandle),
    {
        let mut child = TestHandle::new(format!("{}/{}", self.name, subtest_name(name)));
        debug!(target: "e2e.test", test = %child.name, "Subtest started");

        f(&mut child);

        let report = child.finish();
        let passed = report.outcome != Outcome::Failed;
        if !passed {
            self.failed = true;
        }
        self.children.push(report);
        passed
    }

    /// Close the handle and produce its report.
    pub fn finish(self) -> TestReport {
        let outcome = self.outcome();
        debug!(target: "e2e.test", test = %self.name, outcome = %outcome, "Test finished");
        TestReport {
            name: self.name,
            outcome,
            messages: self.messages,
            duration: self.started.elapsed(),
            children: self.children,
        }
    }
}

/// Subtest names use underscores for whitespace so they can be selected
/// with a regex without quoting.
fn subtest_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

// =============================================================================
// Suite
// =============================================================================

type TestFunc = Box<dyn Fn(&mut Environment, &mut TestHandle) + Send + Sync>;

/// Aggregated result of a suite run.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub tests: Vec<TestReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.tests.iter().filter(|t| t.outcome == outcome).count()
    }

    /// 0 when nothing failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed() > 0)
    }
}

/// Ordered collection of top-level tests.
pub struct TestSuite {
    tests: Vec<(String, TestFunc)>,
    filter: Option<Regex>,
}

impl fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSuite")
            .field(
                "tests",
                &self.tests.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .field("filter", &self.filter.as_ref().map(Regex::as_str))
            .finish()
    }
}

impl Default for TestSuite {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSuite {
    pub fn new() -> Self {
        Self {
            tests: Vec::new(),
            filter: None,
        }
    }

    /// Register a top-level test.
    #[must_use]
    pub fn test<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Environment, &mut TestHandle) + Send + Sync + 'static,
    {
        self.tests.push((name.into(), Box::new(func)));
        self
    }

    /// Only run tests whose name matches `pattern`.
    pub fn with_filter(mut self, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
            filter: "test",
            pattern: pattern.to_string(),
            source,
        })?;
        self.filter = Some(regex);
        Ok(self)
    }

    /// Names of the registered tests, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tests.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run the selected tests one after another and collect their reports.
    pub fn run_tests(&self, env: &mut Environment) -> SuiteReport {
        let mut report = SuiteReport::default();

        for (name, func) in &self.tests {
            if let Some(filter) = &self.filter {
                if !filter.is_match(name) {
                    debug!(target: "e2e.suite", test = %name, "Test not selected by filter");
                    continue;
                }
            }

            info!(target: "e2e.suite", test = %name, "=== RUN");
            let mut t = TestHandle::new(name.clone());
            func(env, &mut t);
            let test_report = t.finish();
            info!(
                target: "e2e.suite",
                test = %name,
                outcome = %test_report.outcome,
                duration_ms = test_report.duration.as_millis() as u64,
                "--- {}",
                test_report.outcome
            );
            report.tests.push(test_report);
        }

        info!(
            target: "e2e.suite",
            passed = report.passed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Suite finished"
        );
        report
    }

    /// Run the suite and return a process exit code.
    pub fn run(&self, env: &mut Environment) -> i32 {
        self.run_tests(env).exit_code()
    }
}
