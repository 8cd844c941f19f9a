//! Core execution engine for the gantry data-driven test framework.
//!
//! Gantry runs test suites whose test methods may execute either
//! directly in-process or inside an external, long-lived host runtime
//! process. This crate carries the process-agnostic half:
//!
//! - the immutable [`case::TestCase`] descriptors supplied by discovery
//! - the [`context::ExecutionContext`] tree threaded through one run
//! - the timeout-bounded [`stage::Stage`] state machine with outcome
//!   classification
//! - the [`orchestrator::SuiteOrchestrator`] sequencing stages per the
//!   suite/test lifecycle
//! - the [`protocol`] wire types and the [`dispatch::CommandDispatcher`]
//! - the [`executor::CommandExecutor`] abstraction with its in-process
//!   implementation
//!
//! Process supervision, the framed channel, and the remote executor live
//! in the companion `gantry-host` crate.

pub mod case;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod output;
pub mod protocol;
pub mod report;
pub mod stage;
pub mod suite;

pub use case::{ParameterSet, TestCase};
pub use config::{ConfigError, ExecutionConfig};
pub use context::{Disposable, ExecutionContext};
pub use dispatch::CommandDispatcher;
pub use error::EngineError;
pub use events::{EventKind, EventListener, EventStatistics, ListenerSet, TestEvent};
pub use executor::{CommandExecutor, InProcessExecutor};
pub use orchestrator::{ResourceMonitor, SuiteOrchestrator, SuiteSummary};
pub use output::OutputCapture;
pub use protocol::{Command, FaultPayload, HostMessage, ProtocolError, Response, ResponseStatus};
pub use report::{Report, ReportKind};
pub use stage::{
    Stage, StageBinding, StageDescriptor, StageFault, StageKind, StageScope, DEFAULT_STAGE_TIMEOUT,
};
pub use suite::{InMemorySuiteRegistry, SuiteBuilder, SuiteRegistry, TestSuite};
