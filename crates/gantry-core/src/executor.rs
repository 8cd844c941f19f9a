//! Command executor abstraction: in-process or remote, same contract.
//!
//! The orchestrating side is agnostic to where a test body physically
//! executes. Both implementations share this trait; the in-process
//! executor dispatches directly, the remote executor (in the host crate)
//! delegates across the framed channel to a supervised runtime process.
//! Swapping implementations must not change suite/test semantics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::EngineError;
use crate::events::{EventListener, ListenerSet};
use crate::orchestrator::ResourceMonitor;
use crate::protocol::{Command, Response};
use crate::suite::SuiteRegistry;

/// Contract shared by every executor implementation.
#[async_trait]
pub trait CommandExecutor: Send {
    /// Prepare the executor (for the remote case: launch and connect to
    /// the runtime process).
    ///
    /// # Errors
    ///
    /// Returns an error when the execution environment cannot be
    /// established; no test body can meaningfully execute afterwards.
    async fn start(&mut self) -> Result<(), EngineError>;

    /// Tear the executor down. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when teardown could not complete cleanly.
    async fn stop(&mut self) -> Result<(), EngineError>;

    /// Execute one command, publishing lifecycle events to `listener`.
    ///
    /// Never fails: every failure mode is encoded in the response
    /// status.
    async fn execute_command(
        &mut self,
        command: Command,
        listener: Arc<dyn EventListener>,
        cancellation: CancellationToken,
    ) -> Response;
}

/// Executor running commands directly in the current process.
pub struct InProcessExecutor {
    dispatcher: CommandDispatcher,
    config: ExecutionConfig,
}

impl InProcessExecutor {
    /// Create an in-process executor over `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn SuiteRegistry>, config: ExecutionConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(registry, config.clone()),
            config,
        }
    }

    /// Attach a resource monitor forwarded to every suite run.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.dispatcher = self.dispatcher.with_monitor(monitor);
        self
    }
}

#[async_trait]
impl CommandExecutor for InProcessExecutor {
    async fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute_command(
        &mut self,
        command: Command,
        listener: Arc<dyn EventListener>,
        cancellation: CancellationToken,
    ) -> Response {
        let mut listeners = ListenerSet::new();
        listeners.register(listener);

        let session_budget = self.config.session_timeout;
        let dispatched = self
            .dispatcher
            .dispatch(command, Arc::new(listeners), cancellation);

        match tokio::time::timeout(session_budget, dispatched).await {
            Ok(response) => response,
            Err(_elapsed) => Response::gone(format!(
                "session exceeded its {}s budget",
                session_budget.as_secs()
            )),
        }
    }
}
