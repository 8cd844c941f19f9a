//! Suite sequencing: setup, parameterized expansion, teardown, events.
//!
//! The orchestrator drives [`Stage`]s through an [`ExecutionContext`]
//! tree in a deterministic order: suite-setup, then every discovered
//! case in discovery order (expanding parameter sets in declaration
//! order, each under its own invocation context), then suite-teardown.
//! One suite runs at a time per engine instance; there is no parallelism
//! inside a suite.
//!
//! Ordering guarantees:
//!
//! - events are strictly nested: suite-before → (test-before →
//!   (nested pairs) → test-after)* → suite-after
//! - teardown always runs for a started test, even after setup or body
//!   failure
//! - a skipped case fires its lifecycle events but never invokes a stage

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::case::TestCase;
use crate::config::ExecutionConfig;
use crate::context::ExecutionContext;
use crate::events::{EventStatistics, ListenerSet, TestEvent};
use crate::output::OutputCapture;
use crate::report::{Report, ReportKind};
use crate::stage::StageScope;
use crate::suite::TestSuite;

/// Collaborator tracking engine-specific resources leaked by a test.
///
/// `mark` snapshots before an invocation; `orphan_count` reports how
/// many resources leaked since the mark. Counts greater than zero
/// synthesize a front-inserted warning on the invocation's context.
pub trait ResourceMonitor: Send + Sync {
    /// Snapshot resource state before an invocation.
    fn mark(&self);

    /// Resources orphaned since the last mark.
    fn orphan_count(&self) -> usize;
}

/// Final result of one suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    /// Qualified suite name.
    pub suite: String,
    /// Aggregated counts for the whole run.
    pub statistics: EventStatistics,
}

/// Running aggregate over combinations as the suite progresses.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: usize,
    completed: usize,
    failed: usize,
    errors: usize,
    warnings: usize,
    skipped: usize,
    orphans: usize,
}

impl Tally {
    fn snapshot(&self, root: &ExecutionContext) -> EventStatistics {
        let elapsed_ms = u64::try_from(root.elapsed().as_millis()).unwrap_or(u64::MAX);
        EventStatistics {
            total_tests: self.total,
            completed_tests: self.completed,
            failed: self.failed,
            errors: self.errors,
            warnings: self.warnings,
            skipped: self.skipped,
            orphans: self.orphans,
            elapsed_ms,
            is_failed: self.failed > 0 || self.errors > 0,
        }
    }

    /// Fold one finished combination's context into the aggregate.
    fn absorb(&mut self, ctx: &ExecutionContext) {
        self.completed += 1;
        if ctx.has_failures() {
            self.failed += 1;
        }
        if ctx.has_errors() {
            self.errors += 1;
        }
        self.warnings += ctx.warning_count();
    }
}

/// Sequences stages per the suite/test state machine.
pub struct SuiteOrchestrator {
    config: ExecutionConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
}

impl SuiteOrchestrator {
    /// Create an orchestrator with the given configuration.
    #[must_use]
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            monitor: None,
        }
    }

    /// Attach a resource monitor collaborator.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Run every discovered case of `suite`.
    pub async fn run(
        &self,
        suite: &TestSuite,
        listeners: Arc<ListenerSet>,
        cancellation: &CancellationToken,
    ) -> SuiteSummary {
        self.run_cases(suite, None, listeners, cancellation).await
    }

    /// Run `suite` restricted to `filter` (all cases when `None`).
    pub async fn run_cases(
        &self,
        suite: &TestSuite,
        filter: Option<&[TestCase]>,
        listeners: Arc<ListenerSet>,
        cancellation: &CancellationToken,
    ) -> SuiteSummary {
        let cases: Vec<TestCase> = match filter {
            Some(cases) => cases.to_vec(),
            None => suite.cases().to_vec(),
        };

        let root = ExecutionContext::root(suite.name(), Arc::clone(&listeners));
        let mut tally = Tally {
            total: cases.iter().map(TestCase::combination_count).sum(),
            ..Tally::default()
        };

        info!(suite = suite.name(), cases = cases.len(), "suite run starting");
        listeners.fire(&TestEvent::suite_before(
            suite.name(),
            tally.snapshot(&root),
        ));

        let suite_capture = OutputCapture::new(self.config.capture_output);
        suite
            .setup()
            .run(&root, StageScope::empty(suite_capture.clone()))
            .await;

        for case in &cases {
            if cancellation.is_cancelled() {
                warn!(suite = suite.name(), "suite run cancelled between cases");
                break;
            }
            self.run_case(suite, case, &root, &mut tally, cancellation)
                .await;
        }

        suite
            .teardown()
            .run(&root, StageScope::empty(suite_capture.clone()))
            .await;
        self.flush_capture(&root, &suite_capture);

        root.dispose();

        let mut statistics = tally.snapshot(&root);
        if root.has_failures() || root.has_errors() {
            statistics.is_failed = true;
        }

        listeners.fire(&TestEvent::suite_after(
            suite.name(),
            statistics,
            root.reports(),
        ));
        info!(
            suite = suite.name(),
            completed = statistics.completed_tests,
            failed = statistics.failed,
            errors = statistics.errors,
            skipped = statistics.skipped,
            "suite run finished"
        );

        SuiteSummary {
            suite: suite.name().to_string(),
            statistics,
        }
    }

    async fn run_case(
        &self,
        suite: &TestSuite,
        case: &TestCase,
        root: &Arc<ExecutionContext>,
        tally: &mut Tally,
        cancellation: &CancellationToken,
    ) {
        let listeners = Arc::clone(root.listeners());
        let case_ctx = root.child(&case.name);

        listeners.fire(&TestEvent::test_before(
            suite.name(),
            &case.name,
            tally.snapshot(root),
        ));

        if case.skipped {
            self.skip_case(suite, case, &case_ctx, tally);
        } else if case.is_parameterized() {
            for (index, set) in case.parameter_sets.iter().enumerate() {
                if cancellation.is_cancelled() {
                    break;
                }
                let label = format!("{}:{}", case.name, set.display_label(index));
                let set_ctx = case_ctx.child(&label);

                listeners.fire(&TestEvent::test_before(
                    suite.name(),
                    &label,
                    tally.snapshot(root),
                ));

                for iteration in 0..set.invocation_count() {
                    if cancellation.is_cancelled() {
                        break;
                    }
                    let invocation_ctx = set_ctx.child(format!("{label} [{iteration}]"));
                    let scope = StageScope {
                        args: set.args.clone(),
                        seed: set.seed,
                        iteration,
                        output: OutputCapture::new(self.config.capture_output),
                    };
                    tally.orphans += self
                        .run_invocation(suite, case, &invocation_ctx, scope)
                        .await;
                }

                tally.absorb(&set_ctx);
                listeners.fire(&TestEvent::test_after(
                    suite.name(),
                    &label,
                    tally.snapshot(root),
                    set_ctx.collect_reports(),
                ));
                set_ctx.dispose();
            }
        } else {
            let scope = StageScope::empty(OutputCapture::new(self.config.capture_output));
            tally.orphans += self.run_invocation(suite, case, &case_ctx, scope).await;
            tally.absorb(&case_ctx);
        }

        listeners.fire(&TestEvent::test_after(
            suite.name(),
            &case.name,
            tally.snapshot(root),
            case_ctx.collect_reports(),
        ));
        case_ctx.dispose();
    }

    /// Fire lifecycle bookkeeping for a skipped case without invoking
    /// any stage.
    fn skip_case(
        &self,
        suite: &TestSuite,
        case: &TestCase,
        case_ctx: &Arc<ExecutionContext>,
        tally: &mut Tally,
    ) {
        debug!(case = %case.name, "skipping test case");
        case_ctx.set_skipped(true);
        case_ctx.add_report(Report::skipped(
            Some(case.line),
            "test case is marked as skipped",
        ));

        if case.is_parameterized() {
            let listeners = Arc::clone(case_ctx.listeners());
            for (index, set) in case.parameter_sets.iter().enumerate() {
                let label = format!("{}:{}", case.name, set.display_label(index));
                let set_ctx = case_ctx.child(&label);
                set_ctx.set_skipped(true);
                tally.skipped += 1;

                let parent = case_ctx
                    .parent()
                    .unwrap_or_else(|| Arc::clone(case_ctx));
                listeners.fire(&TestEvent::test_before(
                    suite.name(),
                    &label,
                    tally.snapshot(&parent),
                ));
                listeners.fire(&TestEvent::test_after(
                    suite.name(),
                    &label,
                    tally.snapshot(&parent),
                    set_ctx.reports(),
                ));
                set_ctx.dispose();
            }
        } else {
            tally.skipped += 1;
        }
    }

    /// Run setup → body → teardown for one invocation. Teardown runs
    /// unconditionally once setup has started. Returns the orphan count
    /// observed by the resource monitor.
    async fn run_invocation(
        &self,
        suite: &TestSuite,
        case: &TestCase,
        ctx: &Arc<ExecutionContext>,
        scope: StageScope,
    ) -> usize {
        if let Some(monitor) = &self.monitor {
            monitor.mark();
        }

        suite.before_test().run(ctx, scope.clone()).await;

        match suite.body_for(&case.name) {
            Some(body) => body.run(ctx, scope.clone()).await,
            None => ctx.add_report(Report::new(
                ReportKind::Error,
                Some(case.line),
                format!("no test body bound for '{}'", case.name),
            )),
        }

        suite.after_test().run(ctx, scope.clone()).await;

        self.flush_capture(ctx, &scope.output);

        let orphans = match &self.monitor {
            Some(monitor) => monitor.orphan_count(),
            None => 0,
        };
        if orphans > 0 {
            ctx.prepend_report(Report::warning(
                Some(case.line),
                format!(
                    "{orphans} orphaned resource(s) left behind by '{}'",
                    case.name
                ),
            ));
        }

        ctx.dispose();
        orphans
    }

    /// Attach captured output as a single stdout report, then echo it to
    /// the real stream.
    fn flush_capture(&self, ctx: &ExecutionContext, capture: &OutputCapture) {
        let captured = capture.take();
        if !captured.is_empty() {
            ctx.add_report(Report::stdout(captured.clone()));
            print!("{captured}");
        }
    }
}
