//! Bound test suites and the registry resolving qualified names.
//!
//! Discovery hands the engine immutable [`TestCase`] descriptors; the
//! embedding application binds those descriptors to callables via
//! [`SuiteBuilder`] and registers the result. Commands reference suites
//! by qualified name only, so suite definitions round-trip across the
//! process boundary without serializing callables.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::case::TestCase;
use crate::stage::{Stage, StageKind};

/// One suite with its lifecycle stages bound.
///
/// Non-body roles bind at most one method per suite; each test case
/// binds its own body stage.
#[derive(Debug)]
pub struct TestSuite {
    name: String,
    setup: Stage,
    teardown: Stage,
    before_test: Stage,
    after_test: Stage,
    bodies: HashMap<String, Stage>,
    cases: Vec<TestCase>,
}

impl TestSuite {
    /// Start building a suite.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SuiteBuilder {
        SuiteBuilder {
            name: name.into(),
            setup: Stage::unbound(StageKind::SuiteSetup),
            teardown: Stage::unbound(StageKind::SuiteTeardown),
            before_test: Stage::unbound(StageKind::TestSetup),
            after_test: Stage::unbound(StageKind::TestTeardown),
            bodies: HashMap::new(),
            cases: Vec::new(),
        }
    }

    /// Qualified suite name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suite-setup stage (unbound when the suite declares none).
    #[must_use]
    pub const fn setup(&self) -> &Stage {
        &self.setup
    }

    /// Suite-teardown stage.
    #[must_use]
    pub const fn teardown(&self) -> &Stage {
        &self.teardown
    }

    /// Test-setup stage.
    #[must_use]
    pub const fn before_test(&self) -> &Stage {
        &self.before_test
    }

    /// Test-teardown stage.
    #[must_use]
    pub const fn after_test(&self) -> &Stage {
        &self.after_test
    }

    /// Discovered cases in discovery order.
    #[must_use]
    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Body stage for a case, by qualified name.
    #[must_use]
    pub fn body_for(&self, case_name: &str) -> Option<&Stage> {
        self.bodies.get(case_name)
    }

    /// Total (case × parameter set) combinations across the suite.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        self.cases.iter().map(TestCase::combination_count).sum()
    }
}

/// Builder assembling a [`TestSuite`].
#[derive(Debug)]
pub struct SuiteBuilder {
    name: String,
    setup: Stage,
    teardown: Stage,
    before_test: Stage,
    after_test: Stage,
    bodies: HashMap<String, Stage>,
    cases: Vec<TestCase>,
}

impl SuiteBuilder {
    /// Bind the suite-setup stage.
    #[must_use]
    pub fn setup(mut self, stage: Stage) -> Self {
        self.setup = stage;
        self
    }

    /// Bind the suite-teardown stage.
    #[must_use]
    pub fn teardown(mut self, stage: Stage) -> Self {
        self.teardown = stage;
        self
    }

    /// Bind the test-setup stage.
    #[must_use]
    pub fn before_test(mut self, stage: Stage) -> Self {
        self.before_test = stage;
        self
    }

    /// Bind the test-teardown stage.
    #[must_use]
    pub fn after_test(mut self, stage: Stage) -> Self {
        self.after_test = stage;
        self
    }

    /// Register a case with its body stage, in discovery order.
    #[must_use]
    pub fn case(mut self, case: TestCase, body: Stage) -> Self {
        self.bodies.insert(case.name.clone(), body);
        self.cases.push(case);
        self
    }

    /// Finish the suite.
    #[must_use]
    pub fn build(self) -> TestSuite {
        TestSuite {
            name: self.name,
            setup: self.setup,
            teardown: self.teardown,
            before_test: self.before_test,
            after_test: self.after_test,
            bodies: self.bodies,
            cases: self.cases,
        }
    }
}

/// Resolves qualified suite names to bound suites.
pub trait SuiteRegistry: Send + Sync {
    /// Look up a suite by qualified name.
    fn resolve(&self, name: &str) -> Option<Arc<TestSuite>>;

    /// Names of every registered suite.
    fn suite_names(&self) -> Vec<String>;
}

/// Registry backed by an in-memory map.
#[derive(Debug, Default)]
pub struct InMemorySuiteRegistry {
    suites: RwLock<HashMap<String, Arc<TestSuite>>>,
}

impl InMemorySuiteRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite, replacing any previous one with the same name.
    pub fn register(&self, suite: TestSuite) {
        self.suites
            .write()
            .expect("suite registry lock poisoned")
            .insert(suite.name().to_string(), Arc::new(suite));
    }
}

impl SuiteRegistry for InMemorySuiteRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<TestSuite>> {
        self.suites
            .read()
            .expect("suite registry lock poisoned")
            .get(name)
            .cloned()
    }

    fn suite_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .suites
            .read()
            .expect("suite registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_registers_cases_in_order() {
        let suite = TestSuite::builder("demo")
            .case(
                TestCase::new("demo.first", 1),
                Stage::unbound(StageKind::TestBody),
            )
            .case(
                TestCase::new("demo.second", 2),
                Stage::unbound(StageKind::TestBody),
            )
            .build();

        let names: Vec<&str> = suite.cases().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["demo.first", "demo.second"]);
        assert!(suite.body_for("demo.first").is_some());
        assert!(suite.body_for("demo.missing").is_none());
    }

    #[test]
    fn test_registry_resolves_registered_suites() {
        let registry = InMemorySuiteRegistry::new();
        registry.register(TestSuite::builder("demo").build());

        assert!(registry.resolve("demo").is_some());
        assert!(registry.resolve("other").is_none());
        assert_eq!(registry.suite_names(), vec!["demo".to_string()]);
    }
}
