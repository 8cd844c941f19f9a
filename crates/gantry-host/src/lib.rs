//! Process supervision and framed IPC for the gantry test engine.
//!
//! This crate carries the process-boundary half of gantry:
//!
//! - [`channel::FramedChannel`]: length-prefixed message transport over
//!   a bidirectional byte stream
//! - [`supervisor::RuntimeSupervisor`]: lifecycle state machine over
//!   the external runtime process (capability probe, bridge install,
//!   staged compile, launch, escalating termination)
//! - [`remote::RemoteExecutor`]: the `CommandExecutor` implementation
//!   that delegates across the channel to a supervised runtime
//! - [`serve`]: the runtime-side loop answering framed commands
//!
//! The `gantry-host` binary embeds the serve loop inside the external
//! runtime process.

pub mod channel;
pub mod remote;
pub mod serve;
pub mod supervisor;

pub use channel::{BoxedStream, ByteStream, ChannelError, FramedChannel};
pub use remote::{RemoteExecutor, DEFAULT_READINESS_TIMEOUT};
pub use serve::serve_connection;
pub use supervisor::{
    DebuggerHook, RuntimeSupervisor, SupervisorConfig, SupervisorError, SupervisorState,
    DEFAULT_CAPABILITY_FLAG,
};
