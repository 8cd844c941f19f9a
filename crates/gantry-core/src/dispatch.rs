//! Single-command dispatch with structured failure responses.
//!
//! The dispatcher executes one typed [`Command`] against the registered
//! suites and never lets a failure escape as anything but a [`Response`]:
//! unknown suites become `bad_request`, handler panics become
//! `internal_error` with the serialized fault, and observed cancellation
//! becomes `gone`. Both the in-process executor and the host serve loop
//! go through this one path, so swapping executors cannot change
//! semantics.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ExecutionConfig;
use crate::events::ListenerSet;
use crate::orchestrator::{ResourceMonitor, SuiteOrchestrator};
use crate::protocol::{Command, FaultPayload, Response};
use crate::stage::panic_message;
use crate::suite::SuiteRegistry;

/// Executes one command against a result-producing handler.
pub struct CommandDispatcher {
    registry: Arc<dyn SuiteRegistry>,
    config: ExecutionConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
}

impl CommandDispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn SuiteRegistry>, config: ExecutionConfig) -> Self {
        Self {
            registry,
            config,
            monitor: None,
        }
    }

    /// Attach a resource monitor forwarded to every suite run.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Execute `command`, publishing lifecycle events to `listeners`.
    ///
    /// Always returns a response; failures are encoded in the status.
    pub async fn dispatch(
        &self,
        command: Command,
        listeners: Arc<ListenerSet>,
        cancellation: CancellationToken,
    ) -> Response {
        debug!(?command, "dispatching command");
        match command {
            Command::Ping => Response::ok(&serde_json::json!({ "pong": true })),
            Command::Shutdown => Response::ok(&serde_json::json!({ "shutdown": true })),
            Command::RunSuite { suite, cases } => {
                self.run_suite(&suite, cases, listeners, cancellation).await
            }
        }
    }

    async fn run_suite(
        &self,
        suite_name: &str,
        cases: Vec<crate::case::TestCase>,
        listeners: Arc<ListenerSet>,
        cancellation: CancellationToken,
    ) -> Response {
        let Some(suite) = self.registry.resolve(suite_name) else {
            return Response::bad_request(format!("unknown test suite '{suite_name}'"));
        };

        let mut orchestrator = SuiteOrchestrator::new(self.config.clone());
        if let Some(monitor) = &self.monitor {
            orchestrator = orchestrator.with_monitor(Arc::clone(monitor));
        }

        // The run happens on its own task so a panic anywhere in the
        // suite machinery lands here as a join error instead of tearing
        // down the caller.
        let run_cancellation = cancellation.clone();
        let handle = tokio::spawn(async move {
            let filter = if cases.is_empty() { None } else { Some(cases) };
            orchestrator
                .run_cases(&suite, filter.as_deref(), listeners, &run_cancellation)
                .await
        });

        match handle.await {
            Ok(summary) => {
                if cancellation.is_cancelled() {
                    Response::gone(format!("suite run '{suite_name}' was cancelled"))
                } else {
                    Response::ok(&summary)
                }
            }
            Err(join_error) => {
                let fault = FaultPayload {
                    kind: "unhandled_panic".to_string(),
                    message: panic_message(join_error),
                };
                error!(suite = suite_name, fault = %fault.message, "suite run panicked");
                Response::internal_error(&fault)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;
    use crate::suite::{InMemorySuiteRegistry, TestSuite};

    fn dispatcher() -> CommandDispatcher {
        let registry = InMemorySuiteRegistry::new();
        registry.register(TestSuite::builder("demo").build());
        CommandDispatcher::new(Arc::new(registry), ExecutionConfig::default())
    }

    #[tokio::test]
    async fn test_ping_answers_ok() {
        let response = dispatcher()
            .dispatch(
                Command::Ping,
                Arc::new(ListenerSet::new()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Ok);
    }

    #[tokio::test]
    async fn test_unknown_suite_is_bad_request() {
        let response = dispatcher()
            .dispatch(
                Command::RunSuite {
                    suite: "missing".to_string(),
                    cases: Vec::new(),
                },
                Arc::new(ListenerSet::new()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::BadRequest);
        assert!(response.payload.contains("missing"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_gone() {
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let response = dispatcher()
            .dispatch(
                Command::RunSuite {
                    suite: "demo".to_string(),
                    cases: Vec::new(),
                },
                Arc::new(ListenerSet::new()),
                cancellation,
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Gone);
    }
}
