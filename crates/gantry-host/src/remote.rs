//! Remote command executor: delegate execution to a supervised runtime.
//!
//! The remote executor implements the same [`CommandExecutor`] contract
//! as the in-process one; the orchestrating side cannot tell them
//! apart. `start` binds a Unix listener, drives the supervisor's launch
//! sequence (capability probe → bridge install → compile → run), and
//! treats the runtime connecting back as the readiness signal. Commands
//! then travel over the framed channel; lifecycle events stream back to
//! the listener and the final response resolves the call.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::protocol::HostMessage;
use gantry_core::{Command, CommandExecutor, EngineError, EventListener, ExecutionConfig, Response};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{BoxedStream, FramedChannel};
use crate::supervisor::{RuntimeSupervisor, SupervisorConfig};

/// How long `start` waits for the runtime to connect back.
pub const DEFAULT_READINESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Executor that runs commands inside a supervised runtime process.
pub struct RemoteExecutor {
    supervisor_config: SupervisorConfig,
    config: ExecutionConfig,
    socket_path: PathBuf,
    readiness_timeout: std::time::Duration,
    supervisor: Option<Arc<RuntimeSupervisor>>,
    channel: Option<FramedChannel<BoxedStream>>,
}

impl RemoteExecutor {
    /// Create a remote executor. `socket_path` is where the runtime
    /// connects back; it is forwarded to the launch as
    /// `--connect <path>`.
    #[must_use]
    pub fn new(
        supervisor_config: SupervisorConfig,
        config: ExecutionConfig,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supervisor_config,
            config,
            socket_path: socket_path.into(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            supervisor: None,
            channel: None,
        }
    }

    /// Override the readiness wait.
    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// The supervisor driving the runtime process, once started.
    #[must_use]
    pub fn supervisor(&self) -> Option<&Arc<RuntimeSupervisor>> {
        self.supervisor.as_ref()
    }

    #[cfg(test)]
    fn with_injected_channel(mut self, channel: FramedChannel<BoxedStream>) -> Self {
        self.channel = Some(channel);
        self
    }
}

#[async_trait]
impl CommandExecutor for RemoteExecutor {
    async fn start(&mut self) -> Result<(), EngineError> {
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|error| EngineError::Process(format!("failed to bind channel socket: {error}")))?;

        let mut supervisor_config = self.supervisor_config.clone();
        supervisor_config = supervisor_config.with_launch_args([
            "--connect".to_string(),
            self.socket_path.display().to_string(),
        ]);
        let supervisor = Arc::new(RuntimeSupervisor::new(supervisor_config));
        self.supervisor = Some(Arc::clone(&supervisor));

        let pid = match supervisor.launch().await {
            Ok(pid) => pid,
            Err(error) => {
                supervisor.shutdown().await;
                return Err(EngineError::Process(error.to_string()));
            }
        };

        // Readiness: the runtime connects back to the channel socket.
        let accepted = tokio::time::timeout(self.readiness_timeout, listener.accept()).await;
        let stream = match accepted {
            Ok(Ok((stream, _addr))) => stream,
            Ok(Err(error)) => {
                supervisor.shutdown().await;
                return Err(EngineError::Process(format!(
                    "failed to accept runtime connection: {error}"
                )));
            }
            Err(_elapsed) => {
                supervisor.shutdown().await;
                return Err(EngineError::Process(format!(
                    "runtime process (pid {pid}) did not connect within {:?}",
                    self.readiness_timeout
                )));
            }
        };

        info!(pid, socket = %self.socket_path.display(), "runtime connected; channel ready");
        self.channel = Some(FramedChannel::new(Box::new(stream) as BoxedStream));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        if let Some(channel) = &mut self.channel {
            // Best effort: ask the serve loop to exit cleanly before the
            // kill escalation takes over.
            if let Err(error) = channel.send(&Command::Shutdown).await {
                warn!(%error, "failed to send shutdown command");
            }
        }
        self.channel = None;

        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
        Ok(())
    }

    async fn execute_command(
        &mut self,
        command: Command,
        listener: Arc<dyn EventListener>,
        cancellation: CancellationToken,
    ) -> Response {
        let supervisor = self.supervisor.clone();
        let Some(channel) = self.channel.as_mut() else {
            return Response::gone("remote executor is not started");
        };

        if let Err(error) = channel.send(&command).await {
            return Response::gone(format!("failed to send command: {error}"));
        }

        let exchange = async {
            loop {
                match channel.read_host_message().await {
                    HostMessage::Event(event) => listener.publish_event(&event),
                    HostMessage::Response(response) => break response,
                }
            }
        };

        tokio::select! {
            response = exchange => response,
            () = cancellation.cancelled() => {
                if let Some(supervisor) = supervisor {
                    supervisor.cancel().await;
                }
                Response::gone("command execution was cancelled")
            }
            () = tokio::time::sleep(self.config.session_timeout) => {
                if let Some(supervisor) = supervisor {
                    supervisor.cancel().await;
                }
                Response::gone(format!(
                    "session exceeded its {}s budget",
                    self.config.session_timeout.as_secs()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gantry_core::protocol::ResponseStatus;
    use gantry_core::{
        CommandDispatcher, EventKind, InMemorySuiteRegistry, TestCase, TestEvent, TestSuite,
    };
    use tokio::io::duplex;

    use super::*;
    use crate::serve::serve_connection;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<TestEvent>>,
    }

    impl EventListener for Recorder {
        fn publish_event(&self, event: &TestEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn executor_over_duplex() -> (RemoteExecutor, tokio::task::JoinHandle<()>) {
        let registry = InMemorySuiteRegistry::new();
        registry.register(
            TestSuite::builder("demo")
                .case(
                    TestCase::new("demo.test_one", 1),
                    gantry_core::Stage::unbound(gantry_core::StageKind::TestBody),
                )
                .build(),
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(registry),
            ExecutionConfig::default(),
        ));

        let (engine_side, host_side) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let _ = serve_connection(host_side, dispatcher).await;
        });

        let executor = RemoteExecutor::new(
            SupervisorConfig::new("/bin/true", "."),
            ExecutionConfig::default(),
            "/tmp/unused.sock",
        )
        .with_injected_channel(FramedChannel::new(Box::new(engine_side) as BoxedStream));

        (executor, server)
    }

    #[tokio::test]
    async fn test_execute_command_forwards_events_and_returns_response() {
        let (mut executor, server) = executor_over_duplex();
        let recorder = Arc::new(Recorder::default());

        let response = executor
            .execute_command(
                Command::RunSuite {
                    suite: "demo".to_string(),
                    cases: Vec::new(),
                },
                Arc::clone(&recorder) as Arc<dyn EventListener>,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.status, ResponseStatus::Ok);
        let events = recorder.events.lock().unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::SuiteBefore));
        assert!(events.iter().any(|e| e.kind == EventKind::TestAfter));

        drop(events);
        server.abort();
    }

    #[tokio::test]
    async fn test_unstarted_executor_answers_gone() {
        let mut executor = RemoteExecutor::new(
            SupervisorConfig::new("/bin/true", "."),
            ExecutionConfig::default(),
            "/tmp/unused.sock",
        );
        let recorder = Arc::new(Recorder::default());

        let response = executor
            .execute_command(
                Command::Ping,
                recorder as Arc<dyn EventListener>,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Gone);
    }

    #[tokio::test]
    async fn test_severed_channel_yields_gone_not_hang() {
        let registry = InMemorySuiteRegistry::new();
        registry.register(TestSuite::builder("demo").build());

        let (engine_side, host_side) = duplex(64 * 1024);
        // Host side dies immediately: commands go nowhere.
        drop(host_side);

        let mut executor = RemoteExecutor::new(
            SupervisorConfig::new("/bin/true", "."),
            ExecutionConfig::default(),
            "/tmp/unused.sock",
        )
        .with_injected_channel(FramedChannel::new(Box::new(engine_side) as BoxedStream));

        let recorder = Arc::new(Recorder::default());
        let response = executor
            .execute_command(
                Command::Ping,
                recorder as Arc<dyn EventListener>,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Gone);
    }
}
