//! Immutable test-case descriptors supplied by discovery.
//!
//! Discovery (parsing source files into method/attribute metadata) is a
//! collaborator; the engine only consumes this shape and never parses
//! source itself. Descriptors are created once at discovery time and are
//! read-only afterward.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One bound argument tuple of a parameterized test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Ordered argument tuple, bound positionally to the test body.
    pub args: Vec<Value>,

    /// Optional display-name override for this tuple.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Optional iteration count; the tuple is invoked this many times,
    /// each under its own invocation context. Absent means one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,

    /// Optional random seed handed to the test body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ParameterSet {
    /// Create a parameter set from an argument tuple.
    #[must_use]
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            display_name: None,
            iterations: None,
            seed: None,
        }
    }

    /// Set the display-name override.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the iteration count.
    #[must_use]
    pub const fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Set the random seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of invocations this tuple expands to (at least one).
    #[must_use]
    pub fn invocation_count(&self) -> u32 {
        self.iterations.unwrap_or(1).max(1)
    }

    /// Display label for this tuple at declaration index `index`.
    ///
    /// Uses the override when present, otherwise renders the argument
    /// tuple the way it was declared.
    #[must_use]
    pub fn display_label(&self, index: usize) -> String {
        self.display_name.clone().unwrap_or_else(|| {
            let rendered: Vec<String> = self.args.iter().map(Value::to_string).collect();
            format!("set {index} ({})", rendered.join(", "))
        })
    }
}

/// Identity and expansion data for one discovered test method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Qualified name (`suite.method`).
    pub name: String,

    /// Source line of the declaration.
    pub line: u32,

    /// Parameter sets, in declaration order. Empty for a plain test.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_sets: Vec<ParameterSet>,

    /// Whether the case is marked skipped. Skipped cases fire their
    /// lifecycle events but never invoke any stage.
    #[serde(default)]
    pub skipped: bool,
}

impl TestCase {
    /// Create a plain test case.
    #[must_use]
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            line,
            parameter_sets: Vec::new(),
            skipped: false,
        }
    }

    /// Append one parameter set in declaration order.
    #[must_use]
    pub fn with_parameter_set(mut self, set: ParameterSet) -> Self {
        self.parameter_sets.push(set);
        self
    }

    /// Mark the case skipped.
    #[must_use]
    pub const fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }

    /// Returns `true` when at least one parameter set is declared.
    #[must_use]
    pub fn is_parameterized(&self) -> bool {
        !self.parameter_sets.is_empty()
    }

    /// Number of (case × parameter set) combinations this case expands
    /// to: one for a plain test, one per tuple otherwise.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        self.parameter_sets.len().max(1)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_plain_case_has_one_combination() {
        let case = TestCase::new("suite.test_add", 10);
        assert!(!case.is_parameterized());
        assert_eq!(case.combination_count(), 1);
    }

    #[test]
    fn test_parameterized_case_counts_tuples() {
        let case = TestCase::new("suite.test_add", 10)
            .with_parameter_set(ParameterSet::new(vec![json!(1), json!(2)]))
            .with_parameter_set(ParameterSet::new(vec![json!(3), json!(4)]))
            .with_parameter_set(ParameterSet::new(vec![json!(5), json!(6)]));
        assert!(case.is_parameterized());
        assert_eq!(case.combination_count(), 3);
    }

    #[test]
    fn test_display_label_prefers_override() {
        let set = ParameterSet::new(vec![json!(1)]).with_display_name("one");
        assert_eq!(set.display_label(0), "one");

        let unnamed = ParameterSet::new(vec![json!(1), json!("a")]);
        assert_eq!(unnamed.display_label(2), "set 2 (1, \"a\")");
    }

    #[test]
    fn test_invocation_count_is_at_least_one() {
        let set = ParameterSet::new(vec![]);
        assert_eq!(set.invocation_count(), 1);
        assert_eq!(set.clone().with_iterations(0).invocation_count(), 1);
        assert_eq!(set.with_iterations(5).invocation_count(), 5);
    }

    #[test]
    fn test_case_serialization_round_trip() {
        let case = TestCase::new("suite.test_values", 22)
            .with_parameter_set(
                ParameterSet::new(vec![json!("a")])
                    .with_iterations(3)
                    .with_seed(7),
            )
            .skipped();
        let json = serde_json::to_string(&case).unwrap();
        let parsed: TestCase = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, case);
    }
}
