//! Per-run mutable state, one node per suite/test/iteration granularity.
//!
//! A suite run owns one root [`ExecutionContext`]; children are created
//! per test case, per parameter set, and per single invocation with
//! bound arguments. The context is handed explicitly to whatever stage
//! is currently executing; there is no ambient global, so nested runs
//! cannot cross-contaminate.
//!
//! # Invariants
//!
//! - A context's failure/error/warning status is the recursive OR of its
//!   own reports and every descendant's status.
//! - Report order is emission order; synthesized warnings are
//!   front-inserted via [`ExecutionContext::prepend_report`].
//! - Disposables registered during the run are released exactly once, at
//!   context disposal, on every path: `dispose` is explicit and `Drop`
//!   backstops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::events::ListenerSet;
use crate::report::Report;

/// A resource released when its owning context ends.
pub trait Disposable: Send {
    /// Release the resource. Called exactly once.
    fn dispose(&mut self);
}

impl<F: FnMut() + Send> Disposable for F {
    fn dispose(&mut self) {
        self();
    }
}

/// Mutable state node for one run segment.
pub struct ExecutionContext {
    name: String,
    parent: Weak<ExecutionContext>,
    children: Mutex<Vec<Arc<ExecutionContext>>>,
    reports: Mutex<Vec<Report>>,
    disposables: Mutex<Vec<Box<dyn Disposable>>>,
    listeners: Arc<ListenerSet>,
    skipped: AtomicBool,
    disposed: AtomicBool,
    started: Instant,
}

impl ExecutionContext {
    /// Create the root context of a suite run.
    #[must_use]
    pub fn root(name: impl Into<String>, listeners: Arc<ListenerSet>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            disposables: Mutex::new(Vec::new()),
            listeners,
            skipped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    /// Create a child context and link it under `self`.
    ///
    /// The child shares the root's listener set.
    #[must_use]
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        let child = Arc::new(Self {
            name: name.into(),
            parent: Arc::downgrade(self),
            children: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            disposables: Mutex::new(Vec::new()),
            listeners: Arc::clone(&self.listeners),
            skipped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            started: Instant::now(),
        });
        self.children
            .lock()
            .expect("context children lock poisoned")
            .push(Arc::clone(&child));
        child
    }

    /// Segment name (suite, case, parameter-set label, or invocation).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent context, if this is not the root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.upgrade()
    }

    /// Listener set shared across the whole tree.
    #[must_use]
    pub fn listeners(&self) -> &Arc<ListenerSet> {
        &self.listeners
    }

    /// Append a report in emission order.
    pub fn add_report(&self, report: Report) {
        self.reports
            .lock()
            .expect("context reports lock poisoned")
            .push(report);
    }

    /// Front-insert a synthesized report so it stays visually associated
    /// with the stage it describes. This is the single canonical rule
    /// for synthesized warnings.
    pub fn prepend_report(&self, report: Report) {
        self.reports
            .lock()
            .expect("context reports lock poisoned")
            .insert(0, report);
    }

    /// Snapshot of this context's own reports, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .expect("context reports lock poisoned")
            .clone()
    }

    /// Own reports followed by every descendant's, depth-first in
    /// creation order.
    #[must_use]
    pub fn collect_reports(&self) -> Vec<Report> {
        let mut all = self.reports();
        let children = self
            .children
            .lock()
            .expect("context children lock poisoned")
            .clone();
        for child in children {
            all.extend(child.collect_reports());
        }
        all
    }

    /// Mark or clear the skip state of this segment.
    pub fn set_skipped(&self, skipped: bool) {
        self.skipped.store(skipped, Ordering::Release);
    }

    /// Current skip state.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }

    /// Elapsed wall-clock time since this segment started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Recursive OR over failure reports.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.any(|report| report.kind.is_failure())
    }

    /// Recursive OR over error/abort/interrupted reports.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.any(|report| report.kind.is_error())
    }

    /// Recursive OR over warning reports.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        self.any(|report| report.kind.is_warning())
    }

    /// Warning reports in this subtree.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        let own = self
            .reports
            .lock()
            .expect("context reports lock poisoned")
            .iter()
            .filter(|report| report.kind.is_warning())
            .count();
        let children = self
            .children
            .lock()
            .expect("context children lock poisoned")
            .clone();
        own + children
            .iter()
            .map(|child| child.warning_count())
            .sum::<usize>()
    }

    fn any(&self, predicate: impl Fn(&Report) -> bool + Copy) -> bool {
        if self
            .reports
            .lock()
            .expect("context reports lock poisoned")
            .iter()
            .any(predicate)
        {
            return true;
        }
        let children = self
            .children
            .lock()
            .expect("context children lock poisoned")
            .clone();
        children.iter().any(|child| child.any(predicate))
    }

    /// Register a resource to release when this segment ends.
    pub fn register_disposable(&self, disposable: Box<dyn Disposable>) {
        self.disposables
            .lock()
            .expect("context disposables lock poisoned")
            .push(disposable);
    }

    /// Release registered resources, children first. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = self
            .children
            .lock()
            .expect("context children lock poisoned")
            .clone();
        for child in children {
            child.dispose();
        }
        let mut disposables = {
            let mut guard = self
                .disposables
                .lock()
                .expect("context disposables lock poisoned");
            std::mem::take(&mut *guard)
        };
        for disposable in &mut disposables {
            disposable.dispose();
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Backstop for segments that never reached an explicit dispose.
        if !self.disposed.load(Ordering::Acquire) {
            if let Ok(disposables) = self.disposables.get_mut() {
                for disposable in disposables.iter_mut() {
                    disposable.dispose();
                }
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("skipped", &self.is_skipped())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
