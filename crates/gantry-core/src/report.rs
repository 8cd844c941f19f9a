//! Classified outcome records attached to execution contexts.
//!
//! Every stage outcome (success, assertion failure, timeout, panic,
//! skip, captured output) becomes a [`Report`] on the context that was
//! active when it happened. Report order within a context is emission
//! order; synthesized warnings are front-inserted by the orchestrator so
//! they stay visually associated with the stage that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a single report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Stage completed without incident.
    Success,
    /// Post-execution condition worth surfacing (e.g. leaked resources).
    Warning,
    /// Assertion failure with an expected-vs-actual mismatch.
    Failure,
    /// Generic error raised by user or library code.
    Error,
    /// Unhandled panic; visually distinct from an expected failure.
    Aborted,
    /// Stage or wait exceeded its time budget.
    Interrupted,
    /// Test case was skipped without invoking any stage.
    Skipped,
    /// Standard output captured during a test invocation.
    Stdout,
}

impl ReportKind {
    /// Returns `true` for expected assertion failures.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Returns `true` for unexpected terminations (errors, aborts,
    /// interrupted waits).
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Aborted | Self::Interrupted)
    }

    /// Returns `true` for warnings.
    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(self, Self::Warning)
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skipped",
            Self::Stdout => "stdout",
        };
        write!(f, "{label}")
    }
}

/// One classified outcome record.
///
/// The source line comes from the stage descriptor's declared metadata
/// (or the assertion itself); it is never recovered by walking stack
/// frames. Reports without a known line display `unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Classification of this record.
    pub kind: ReportKind,
    /// Source line the record refers to, when known.
    pub line: Option<u32>,
    /// Human-readable description.
    pub message: String,
    /// Wall-clock time the record was created.
    pub timestamp: DateTime<Utc>,
}

impl Report {
    /// Create a report stamped with the current time.
    #[must_use]
    pub fn new(kind: ReportKind, line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Assertion failure at an explicit line.
    #[must_use]
    pub fn failure(line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(ReportKind::Failure, line, message)
    }

    /// Synthesized warning (leaked resources, teardown observations).
    #[must_use]
    pub fn warning(line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(ReportKind::Warning, line, message)
    }

    /// Unhandled panic or unexpected condition.
    #[must_use]
    pub fn aborted(line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(ReportKind::Aborted, line, message)
    }

    /// Exceeded time budget.
    #[must_use]
    pub fn interrupted(line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(ReportKind::Interrupted, line, message)
    }

    /// Skipped test case.
    #[must_use]
    pub fn skipped(line: Option<u32>, message: impl Into<String>) -> Self {
        Self::new(ReportKind::Skipped, line, message)
    }

    /// Captured standard output.
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(ReportKind::Stdout, None, text)
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "[{}] line {}: {}", self.kind, line, self.message),
            None => write!(f, "[{}] line unknown: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(ReportKind::Failure.is_failure());
        assert!(!ReportKind::Failure.is_error());
        assert!(ReportKind::Aborted.is_error());
        assert!(ReportKind::Interrupted.is_error());
        assert!(ReportKind::Warning.is_warning());
        assert!(!ReportKind::Success.is_error());
    }

    #[test]
    fn test_display_includes_line_or_unknown() {
        let with_line = Report::failure(Some(42), "expected 1 but was 2");
        assert!(with_line.to_string().contains("line 42"));

        let without_line = Report::aborted(None, "panic");
        assert!(without_line.to_string().contains("line unknown"));
    }

    #[test]
    fn test_report_serialization_round_trip() {
        let report = Report::interrupted(Some(7), "stage exceeded its budget");
        let json = serde_json::to_string(&report).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
