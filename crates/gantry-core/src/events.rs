//! Lifecycle events and listener fan-out.
//!
//! The orchestrator publishes ordered lifecycle events (suite-before,
//! nested test-before/test-after pairs, suite-after) to every
//! registered listener, in registration order. Events carry the
//! aggregated counts at emission time plus the report list of the
//! context segment they describe, so a listener can render a
//! human-readable pass/fail result without reaching back into engine
//! state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::Report;

/// Which lifecycle boundary an event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Emitted once before any stage of a suite run.
    SuiteBefore,
    /// Emitted once after suite teardown.
    SuiteAfter,
    /// Emitted before a test case or parameter-set invocation.
    TestBefore,
    /// Emitted after the paired `TestBefore`.
    TestAfter,
}

/// Aggregated counts carried on every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    /// Total (case × parameter set) combinations in the run.
    pub total_tests: usize,
    /// Combinations that have finished executing.
    pub completed_tests: usize,
    /// Combinations with at least one assertion failure.
    pub failed: usize,
    /// Combinations with at least one error/abort/interruption.
    pub errors: usize,
    /// Warning reports observed so far.
    pub warnings: usize,
    /// Combinations skipped without executing.
    pub skipped: usize,
    /// Orphaned resources reported by the resource monitor.
    pub orphans: usize,
    /// Elapsed wall-clock time of the run segment, in milliseconds.
    pub elapsed_ms: u64,
    /// Whether the aggregate outcome is a failure.
    pub is_failed: bool,
}

/// One ordered lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    /// Boundary this event marks.
    pub kind: EventKind,
    /// Qualified suite name.
    pub suite_name: String,
    /// Test case or parameter-set label; absent on suite events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    /// Aggregated counts at emission time.
    pub statistics: EventStatistics,
    /// Reports of the context segment this event describes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<Report>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl TestEvent {
    /// Suite-before event.
    #[must_use]
    pub fn suite_before(suite_name: impl Into<String>, statistics: EventStatistics) -> Self {
        Self {
            kind: EventKind::SuiteBefore,
            suite_name: suite_name.into(),
            test_name: None,
            statistics,
            reports: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Suite-after event carrying the suite-level reports.
    #[must_use]
    pub fn suite_after(
        suite_name: impl Into<String>,
        statistics: EventStatistics,
        reports: Vec<Report>,
    ) -> Self {
        Self {
            kind: EventKind::SuiteAfter,
            suite_name: suite_name.into(),
            test_name: None,
            statistics,
            reports,
            timestamp: Utc::now(),
        }
    }

    /// Test-before event.
    #[must_use]
    pub fn test_before(
        suite_name: impl Into<String>,
        test_name: impl Into<String>,
        statistics: EventStatistics,
    ) -> Self {
        Self {
            kind: EventKind::TestBefore,
            suite_name: suite_name.into(),
            test_name: Some(test_name.into()),
            statistics,
            reports: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Test-after event carrying the segment's reports.
    #[must_use]
    pub fn test_after(
        suite_name: impl Into<String>,
        test_name: impl Into<String>,
        statistics: EventStatistics,
        reports: Vec<Report>,
    ) -> Self {
        Self {
            kind: EventKind::TestAfter,
            suite_name: suite_name.into(),
            test_name: Some(test_name.into()),
            statistics,
            reports,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for ordered lifecycle events.
///
/// Implementations must tolerate being called from the execution task;
/// long-running work belongs on the listener's own side of a channel.
pub trait EventListener: Send + Sync {
    /// Receive one lifecycle event.
    fn publish_event(&self, event: &TestEvent);
}

/// Registration-ordered listener collection, shared from the root
/// execution context to all descendants.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl ListenerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are invoked in registration order.
    pub fn register(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    /// Fan one event out to every listener, in registration order.
    pub fn fire(&self, event: &TestEvent) {
        for listener in &self.listeners {
            listener.publish_event(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns `true` when no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
