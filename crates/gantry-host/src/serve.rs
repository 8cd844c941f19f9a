//! Host-side serve loop: the runtime end of the framed channel.
//!
//! Runs inside the external runtime process. Reads framed commands,
//! dispatches each against the registered suites, streams `event`
//! messages while a suite executes, and answers with a framed response.
//! Exits on the shutdown command or when the peer closes the channel.

use std::sync::Arc;

use gantry_core::protocol::HostMessage;
use gantry_core::{
    Command, CommandDispatcher, EventListener, FaultPayload, ListenerSet, Response, TestEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ByteStream, ChannelError, FramedChannel};

/// Listener that forwards every event onto the channel writer.
struct ChannelListener {
    sender: mpsc::UnboundedSender<TestEvent>,
}

impl EventListener for ChannelListener {
    fn publish_event(&self, event: &TestEvent) {
        // A dropped receiver means the connection is going away; events
        // for a dead peer are discarded.
        let _ = self.sender.send(event.clone());
    }
}

/// Serve one engine connection until shutdown or disconnect.
///
/// Per-message protocol failures (a malformed command) are answered with
/// a `bad_request` response and the loop continues; irrecoverable I/O
/// errors close the channel.
///
/// # Errors
///
/// Returns the underlying channel error when the stream fails outside a
/// clean peer disconnect.
pub async fn serve_connection<S: ByteStream>(
    stream: S,
    dispatcher: Arc<CommandDispatcher>,
) -> Result<(), ChannelError> {
    let mut channel = FramedChannel::new(stream);

    loop {
        let command = match channel.read_command().await {
            Ok(command) => command,
            Err(error) if error.is_disconnect() => {
                info!("engine closed the channel");
                return Ok(());
            }
            Err(ChannelError::Serialization(error)) => {
                warn!(%error, "malformed command frame");
                channel
                    .send(&HostMessage::Response(Response::bad_request(format!(
                        "malformed command: {error}"
                    ))))
                    .await?;
                continue;
            }
            Err(error) => {
                warn!(%error, "irrecoverable channel failure; closing");
                return Err(error);
            }
        };

        let exit_after_reply = matches!(command, Command::Shutdown);
        let response = execute_streaming(&mut channel, &dispatcher, command).await?;
        channel.send(&HostMessage::Response(response)).await?;

        if exit_after_reply {
            info!("shutdown command served; leaving serve loop");
            return Ok(());
        }
    }
}

/// Dispatch one command on its own task, forwarding events onto the
/// channel as they are published.
async fn execute_streaming<S: ByteStream>(
    channel: &mut FramedChannel<S>,
    dispatcher: &Arc<CommandDispatcher>,
    command: Command,
) -> Result<Response, ChannelError> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let mut listeners = ListenerSet::new();
    listeners.register(Arc::new(ChannelListener { sender }));
    let listeners = Arc::new(listeners);

    let dispatcher = Arc::clone(dispatcher);
    let mut run = tokio::spawn(async move {
        dispatcher
            .dispatch(command, listeners, CancellationToken::new())
            .await
    });

    let response = loop {
        tokio::select! {
            // The pattern disables this branch once the dispatch task
            // has dropped its sender.
            Some(event) = receiver.recv() => {
                channel.send(&HostMessage::Event(event)).await?;
            }
            joined = &mut run => {
                break match joined {
                    Ok(response) => response,
                    Err(join_error) => Response::internal_error(&FaultPayload {
                        kind: "unhandled_panic".to_string(),
                        message: join_error.to_string(),
                    }),
                };
            }
        }
    };

    // Events published before the dispatch finished may still be
    // buffered; flush them ahead of the response so ordering holds.
    while let Ok(event) = receiver.try_recv() {
        channel.send(&HostMessage::Event(event)).await?;
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use gantry_core::protocol::ResponseStatus;
    use gantry_core::{EventKind, ExecutionConfig, InMemorySuiteRegistry, TestCase, TestSuite};
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    fn dispatcher_with_empty_suite() -> Arc<CommandDispatcher> {
        let registry = InMemorySuiteRegistry::new();
        registry.register(
            TestSuite::builder("demo")
                .case(
                    TestCase::new("demo.test_one", 1),
                    gantry_core::Stage::unbound(gantry_core::StageKind::TestBody),
                )
                .build(),
        );
        Arc::new(CommandDispatcher::new(
            Arc::new(registry),
            ExecutionConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_serve_streams_events_then_response() {
        let (engine_side, host_side) = duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(host_side, dispatcher_with_empty_suite()));

        let mut channel = FramedChannel::new(engine_side);
        channel
            .send(&Command::RunSuite {
                suite: "demo".to_string(),
                cases: Vec::new(),
            })
            .await
            .unwrap();

        let mut events = Vec::new();
        let response = loop {
            match channel.read_host_message().await {
                HostMessage::Event(event) => events.push(event),
                HostMessage::Response(response) => break response,
            }
        };

        assert_eq!(response.status, ResponseStatus::Ok);
        assert!(events.iter().any(|e| e.kind == EventKind::SuiteBefore));
        assert!(events.iter().any(|e| e.kind == EventKind::SuiteAfter));

        channel.send(&Command::Shutdown).await.unwrap();
        let shutdown_reply = loop {
            match channel.read_host_message().await {
                HostMessage::Event(_) => continue,
                HostMessage::Response(response) => break response,
            }
        };
        assert_eq!(shutdown_reply.status, ResponseStatus::Ok);

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_command_answers_bad_request_and_keeps_serving() {
        let (mut engine_side, host_side) = duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(host_side, dispatcher_with_empty_suite()));

        // Hand-rolled garbage frame.
        let garbage = b"{\"type\":\"nonsense\"}";
        #[allow(clippy::cast_possible_truncation)]
        let len = garbage.len() as u32;
        engine_side.write_all(&len.to_le_bytes()).await.unwrap();
        engine_side.write_all(garbage).await.unwrap();

        let mut channel = FramedChannel::new(engine_side);
        let reply = loop {
            match channel.read_host_message().await {
                HostMessage::Event(_) => continue,
                HostMessage::Response(response) => break response,
            }
        };
        assert_eq!(reply.status, ResponseStatus::BadRequest);

        // The loop is still alive: a ping still answers.
        channel.send(&Command::Ping).await.unwrap();
        let pong = loop {
            match channel.read_host_message().await {
                HostMessage::Event(_) => continue,
                HostMessage::Response(response) => break response,
            }
        };
        assert_eq!(pong.status, ResponseStatus::Ok);

        drop(channel);
        server.await.unwrap().unwrap();
    }
}
