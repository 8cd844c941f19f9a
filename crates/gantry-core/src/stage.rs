//! Timeout-bounded execution of one lifecycle method with outcome
//! classification.
//!
//! A stage binds a lifecycle role (suite setup/teardown, test
//! setup/teardown, test body) to at most one callable and runs it under
//! a per-stage timeout. Whatever happens (assertion failure, panic,
//! exceeded budget), the stage classifies it into exactly one report on
//! the active context and returns normally; the orchestrator never sees
//! an error from a stage.
//!
//! Source lines on reports come from the descriptor's declared metadata
//! (captured at declaration time), never from scanning stack frames at
//! failure time; a line that was never declared stays unknown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinError;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::output::OutputCapture;
use crate::report::Report;

/// Default per-stage time budget, overridable per declaration.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle role a stage occupies within a suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Runs once before any test case.
    SuiteSetup,
    /// Runs once after all test cases.
    SuiteTeardown,
    /// Runs before each test invocation.
    TestSetup,
    /// Runs after each test invocation, even when setup or body failed.
    TestTeardown,
    /// The test method itself.
    TestBody,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::SuiteSetup => "suite-setup",
            Self::SuiteTeardown => "suite-teardown",
            Self::TestSetup => "test-setup",
            Self::TestTeardown => "test-teardown",
            Self::TestBody => "test-body",
        };
        write!(f, "{label}")
    }
}

/// Everything bound to one stage invocation: the argument tuple, the
/// declared seed, the iteration index, and the output capture handle.
#[derive(Debug, Clone, Default)]
pub struct StageScope {
    /// Positionally-bound arguments (empty for plain tests).
    pub args: Vec<Value>,
    /// Random seed declared on the parameter set, if any.
    pub seed: Option<u64>,
    /// Zero-based iteration index within the parameter set.
    pub iteration: u32,
    /// Capture handle for output produced during the invocation.
    pub output: OutputCapture,
}

impl StageScope {
    /// Scope with no bound arguments.
    #[must_use]
    pub fn empty(output: OutputCapture) -> Self {
        Self {
            args: Vec::new(),
            seed: None,
            iteration: 0,
            output,
        }
    }
}

/// Outcome a user callable reports back across the assertion boundary.
///
/// The fluent assertion library is a collaborator; this is its seam.
/// Panics model unhandled exceptions and are caught separately.
#[derive(Debug)]
pub enum StageFault {
    /// Expected-vs-actual mismatch with an explicit source line.
    Assertion {
        /// Line of the failing assertion, when the matcher knows it.
        line: Option<u32>,
        /// Mismatch description.
        message: String,
    },
    /// Explicitly reported failure without assertion metadata.
    Failure(String),
}

/// Synchronous stage callable.
pub type SyncStageFn = Arc<dyn Fn(&StageScope) -> Result<(), StageFault> + Send + Sync>;

/// Asynchronous stage callable.
pub type AsyncStageFn =
    Arc<dyn Fn(StageScope) -> BoxFuture<'static, Result<(), StageFault>> + Send + Sync>;

/// Binding state of a stage: no method found for the role, or a sync or
/// async callable.
#[derive(Clone)]
pub enum StageBinding {
    /// No method found for the role; the stage is a no-op success.
    Unbound,
    /// Callable that runs on the blocking pool.
    Sync(SyncStageFn),
    /// Callable producing a future.
    Async(AsyncStageFn),
}

impl StageBinding {
    /// Returns `true` when a callable is bound.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        !matches!(self, Self::Unbound)
    }

    /// Returns `true` for the async binding.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for StageBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unbound => "Unbound",
            Self::Sync(_) => "Sync",
            Self::Async(_) => "Async",
        };
        f.write_str(label)
    }
}

/// Declaration-time metadata for one stage.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Lifecycle role.
    pub kind: StageKind,
    /// Method name, for diagnostics.
    pub name: String,
    /// Declared source line; used on every report this stage emits.
    pub line: Option<u32>,
    /// Per-stage time budget.
    pub timeout: Duration,
    /// Whether the declaration promises an async method.
    pub declared_async: bool,
}

impl StageDescriptor {
    /// Descriptor with the default timeout and a sync declaration.
    #[must_use]
    pub fn new(kind: StageKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            line: None,
            timeout: DEFAULT_STAGE_TIMEOUT,
            declared_async: false,
        }
    }

    /// Set the declared source line.
    #[must_use]
    pub const fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Override the time budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declare the method async.
    #[must_use]
    pub const fn declared_async(mut self) -> Self {
        self.declared_async = true;
        self
    }
}

enum StageOutcome {
    Completed(Result<(), StageFault>),
    TimedOut,
    Panicked(String),
}

/// One lifecycle method bound under a timeout.
#[derive(Debug, Clone)]
pub struct Stage {
    descriptor: StageDescriptor,
    binding: StageBinding,
}

impl Stage {
    /// Stage with no method bound for `kind`; running it is a no-op
    /// success.
    #[must_use]
    pub fn unbound(kind: StageKind) -> Self {
        Self {
            descriptor: StageDescriptor::new(kind, "<unbound>"),
            binding: StageBinding::Unbound,
        }
    }

    /// Bind a synchronous callable.
    #[must_use]
    pub fn sync(descriptor: StageDescriptor, callable: SyncStageFn) -> Self {
        Self {
            descriptor,
            binding: StageBinding::Sync(callable),
        }
    }

    /// Bind an asynchronous callable.
    #[must_use]
    pub fn from_async(descriptor: StageDescriptor, callable: AsyncStageFn) -> Self {
        Self {
            descriptor,
            binding: StageBinding::Async(callable),
        }
    }

    /// Declaration-time metadata.
    #[must_use]
    pub const fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Returns `true` when a callable is bound.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    /// Run the stage and classify its outcome onto `ctx`.
    ///
    /// Always returns normally; every failure mode lands as exactly one
    /// report:
    ///
    /// - declared/actual asynchrony mismatch → failure report, no
    ///   invocation
    /// - exceeded budget → interrupted report; the abandoned task's
    ///   later outcome is never reported
    /// - assertion fault → failure report at the assertion's line
    /// - panic → abort report
    pub async fn run(&self, ctx: &ExecutionContext, scope: StageScope) {
        if !self.binding.is_bound() {
            return;
        }

        if self.descriptor.declared_async != self.binding.is_async() {
            let (declared, actual) = if self.descriptor.declared_async {
                ("async", "synchronous")
            } else {
                ("synchronous", "async")
            };
            ctx.add_report(Report::failure(
                self.descriptor.line,
                format!(
                    "{} method '{}' is declared {declared} but binds a {actual} callable",
                    self.descriptor.kind, self.descriptor.name
                ),
            ));
            return;
        }

        debug!(
            stage = %self.descriptor.kind,
            method = %self.descriptor.name,
            timeout_ms = self.descriptor.timeout.as_millis() as u64,
            "running stage"
        );

        let outcome = self.invoke(scope).await;
        self.classify(ctx, outcome);
    }

    async fn invoke(&self, scope: StageScope) -> StageOutcome {
        let timeout = self.descriptor.timeout;
        match &self.binding {
            StageBinding::Unbound => StageOutcome::Completed(Ok(())),
            StageBinding::Sync(callable) => {
                let callable = Arc::clone(callable);
                let handle = tokio::task::spawn_blocking(move || callable(&scope));
                match tokio::time::timeout(timeout, handle).await {
                    // Dropping the join handle detaches the task; its
                    // eventual outcome is deliberately unobserved.
                    Err(_elapsed) => StageOutcome::TimedOut,
                    Ok(Err(join_error)) => StageOutcome::Panicked(panic_message(join_error)),
                    Ok(Ok(result)) => StageOutcome::Completed(result),
                }
            }
            StageBinding::Async(callable) => {
                let handle = tokio::spawn(callable(scope));
                match tokio::time::timeout(timeout, handle).await {
                    Err(_elapsed) => StageOutcome::TimedOut,
                    Ok(Err(join_error)) => StageOutcome::Panicked(panic_message(join_error)),
                    Ok(Ok(result)) => StageOutcome::Completed(result),
                }
            }
        }
    }

    fn classify(&self, ctx: &ExecutionContext, outcome: StageOutcome) {
        let descriptor = &self.descriptor;
        match outcome {
            StageOutcome::Completed(Ok(())) => {}
            StageOutcome::TimedOut => ctx.add_report(Report::interrupted(
                descriptor.line,
                format!(
                    "{} method '{}' exceeded its {}ms budget",
                    descriptor.kind,
                    descriptor.name,
                    descriptor.timeout.as_millis()
                ),
            )),
            StageOutcome::Completed(Err(StageFault::Assertion { line, message })) => {
                ctx.add_report(Report::failure(line.or(descriptor.line), message));
            }
            StageOutcome::Completed(Err(StageFault::Failure(message))) => {
                ctx.add_report(Report::failure(descriptor.line, message));
            }
            StageOutcome::Panicked(message) => ctx.add_report(Report::aborted(
                descriptor.line,
                format!(
                    "unhandled panic in {} method '{}': {message}",
                    descriptor.kind, descriptor.name
                ),
            )),
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "task was cancelled before completion".to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ListenerSet;
    use crate::report::ReportKind;

    fn context() -> Arc<ExecutionContext> {
        ExecutionContext::root("suite", Arc::new(ListenerSet::new()))
    }

    fn scope() -> StageScope {
        StageScope::empty(OutputCapture::new(true))
    }

    fn sync_stage(kind: StageKind, callable: SyncStageFn) -> Stage {
        Stage::sync(StageDescriptor::new(kind, "method").with_line(10), callable)
    }

    #[tokio::test]
    async fn test_unbound_stage_is_noop_success() {
        let ctx = context();
        Stage::unbound(StageKind::SuiteSetup).run(&ctx, scope()).await;
        assert!(ctx.reports().is_empty());
    }

    #[tokio::test]
    async fn test_asynchrony_mismatch_fails_without_invocation() {
        let ctx = context();
        let descriptor = StageDescriptor::new(StageKind::TestBody, "method")
            .with_line(33)
            .declared_async();
        let stage = Stage::sync(descriptor, Arc::new(|_scope: &StageScope| Ok(())));

        stage.run(&ctx, scope()).await;

        let reports = ctx.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Failure);
        assert_eq!(reports[0].line, Some(33));
        assert!(reports[0].message.contains("declared async"));
    }

    #[tokio::test]
    async fn test_assertion_fault_becomes_failure_report_with_line() {
        let ctx = context();
        let stage = sync_stage(
            StageKind::TestBody,
            Arc::new(|_scope: &StageScope| {
                Err(StageFault::Assertion {
                    line: Some(77),
                    message: "expected 1 but was 2".to_string(),
                })
            }),
        );

        stage.run(&ctx, scope()).await;

        let reports = ctx.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Failure);
        assert_eq!(reports[0].line, Some(77));
    }

    #[tokio::test]
    async fn test_panic_becomes_abort_report_at_declared_line() {
        let ctx = context();
        let stage = sync_stage(
            StageKind::TestBody,
            Arc::new(|_scope: &StageScope| panic!("boom")),
        );

        stage.run(&ctx, scope()).await;

        let reports = ctx.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Aborted);
        assert_eq!(reports[0].line, Some(10));
        assert!(reports[0].message.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_yields_exactly_one_interrupted_report() {
        let ctx = context();
        let descriptor = StageDescriptor::new(StageKind::TestBody, "slow")
            .with_timeout(Duration::from_millis(50))
            .declared_async();
        let stage = Stage::from_async(
            descriptor,
            Arc::new(|_scope: StageScope| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(StageFault::Failure("late failure".to_string()))
                })
            }),
        );

        stage.run(&ctx, scope()).await;

        // Give the abandoned task a chance to misbehave; it must not
        // add anything.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = ctx.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Interrupted);
    }

    #[tokio::test]
    async fn test_async_stage_success_leaves_no_reports() {
        let ctx = context();
        let descriptor = StageDescriptor::new(StageKind::TestSetup, "setup").declared_async();
        let stage = Stage::from_async(
            descriptor,
            Arc::new(|_scope: StageScope| Box::pin(async { Ok(()) })),
        );

        stage.run(&ctx, scope()).await;
        assert!(ctx.reports().is_empty());
    }
}
