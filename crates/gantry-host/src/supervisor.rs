//! Lifecycle supervision of the external runtime process.
//!
//! The supervisor walks a fixed state machine:
//!
//! ```text
//! NotStarted → VerifyingCapability → InstallingBridge → Compiling
//!            → Running → Exiting → Closed
//! ```
//!
//! - **VerifyingCapability**: probe the runtime binary's help output for
//!   the one required capability flag under a bounded wait; a missing
//!   flag aborts the whole run with a remediation message before any
//!   compile or launch happens.
//! - **InstallingBridge**: idempotently materialize the launcher
//!   resource into the target workspace. If the subsequent compile
//!   fails, a freshly-installed resource is deleted so the next run
//!   retries cleanly.
//! - **Compiling**: headless compile pass, polled for completion on a
//!   fixed interval up to the configured budget; force-killed on
//!   timeout with diagnostics logged.
//! - **Running**: spawn with stdout/stderr line-forwarded to the logger
//!   and an optional debugger-attach hook.
//! - **Exiting → Closed**: SIGKILL, bounded grace wait, then proceed
//!   unconditionally. Double-close is a no-op; the normal shutdown path
//!   and the hard [`RuntimeSupervisor::cancel`] share one lock, so a
//!   double-kill race is impossible.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bounded wait for the capability probe.
pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default fixed poll interval for the compile pass.
pub const DEFAULT_COMPILE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default grace period between SIGKILL and proceeding regardless.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capability flag the runtime binary must advertise in its help output.
pub const DEFAULT_CAPABILITY_FLAG: &str = "--remote-harness";

/// Launcher resource materialized into the target workspace so the
/// runtime knows how to reach back into the engine.
const BRIDGE_RESOURCE: &str = "\
# gantry launcher resource -- materialized by the engine, safe to delete.\n\
[launcher]\n\
protocol = 1\n\
entry = \"gantry-host\"\n";

/// Supervisor state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing has happened yet.
    NotStarted,
    /// Probing the binary for the required capability flag.
    VerifyingCapability,
    /// Materializing the launcher resource into the workspace.
    InstallingBridge,
    /// Headless compile pass in flight.
    Compiling,
    /// Runtime process launched.
    Running,
    /// Shutdown requested; kill in flight.
    Exiting,
    /// Process gone, handlers detached.
    Closed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotStarted => "not-started",
            Self::VerifyingCapability => "verifying-capability",
            Self::InstallingBridge => "installing-bridge",
            Self::Compiling => "compiling",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

/// Supervisor failures. Every variant aborts the run for the suite
/// batch, since no test body can meaningfully execute without the
/// runtime.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The binary's help output lacks the required capability flag.
    #[error(
        "runtime binary '{binary}' does not advertise the '{flag}' capability; \
         install a runtime build that supports '{flag}' or point the engine at a \
         compatible binary"
    )]
    CapabilityMissing {
        /// Probed binary.
        binary: String,
        /// Missing flag.
        flag: String,
    },

    /// The capability probe did not finish within its bounded wait.
    #[error("capability probe of '{binary}' did not finish within {timeout:?}")]
    CapabilityTimeout {
        /// Probed binary.
        binary: String,
        /// Bounded wait.
        timeout: Duration,
    },

    /// The launcher resource could not be materialized.
    #[error("failed to materialize launcher resource at '{path}': {source}")]
    BridgeInstall {
        /// Target path.
        path: String,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// A child process could not be spawned.
    #[error("failed to spawn runtime process: {0}")]
    SpawnFailed(String),

    /// The compile pass exited non-zero.
    #[error("compile step failed with exit code {code:?}")]
    CompileFailed {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The compile pass exceeded its budget and was force-killed.
    #[error("compile step exceeded its {0:?} budget and was force-killed")]
    CompileTimedOut(Duration),

    /// The debugger hook rejected the attach.
    #[error("debugger attach failed: {0}")]
    DebuggerAttach(String),

    /// Cancellation arrived before the launch sequence finished.
    #[error("runtime launch was cancelled")]
    Cancelled,
}

/// Hook invoked with the child PID when a debugger attach is requested.
pub trait DebuggerHook: Send + Sync {
    /// Attach a debugger to the freshly-launched runtime.
    ///
    /// # Errors
    ///
    /// Returns a description of why the attach failed; the supervisor
    /// tears the process down in response.
    fn attach(&self, pid: u32) -> Result<(), String>;
}

/// Launch-time configuration for the supervised runtime.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Runtime executable.
    pub binary: PathBuf,

    /// Working directory for every spawned process.
    pub workspace: PathBuf,

    /// Capability flag the binary must advertise.
    pub capability_flag: String,

    /// Bounded wait for the capability probe.
    pub capability_timeout: Duration,

    /// Workspace-relative path of the launcher resource.
    pub bridge_path: PathBuf,

    /// Arguments for the headless compile pass; empty skips the pass.
    pub compile_args: Vec<String>,

    /// Budget for the compile pass.
    pub compile_timeout: Duration,

    /// Fixed poll interval while the compile pass runs.
    pub compile_poll_interval: Duration,

    /// Fixed entry-point resource path handed to the runtime, if any.
    pub entry_point: Option<String>,

    /// Extra pass-through launch parameters.
    pub launch_args: Vec<String>,

    /// Grace period between SIGKILL and proceeding regardless.
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    /// Configuration with defaults for everything but the binary and
    /// workspace.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workspace: workspace.into(),
            capability_flag: DEFAULT_CAPABILITY_FLAG.to_string(),
            capability_timeout: DEFAULT_CAPABILITY_TIMEOUT,
            bridge_path: PathBuf::from(".gantry/launcher.toml"),
            compile_args: Vec::new(),
            compile_timeout: Duration::from_secs(120),
            compile_poll_interval: DEFAULT_COMPILE_POLL_INTERVAL,
            entry_point: None,
            launch_args: Vec::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Override the capability flag.
    #[must_use]
    pub fn with_capability_flag(mut self, flag: impl Into<String>) -> Self {
        self.capability_flag = flag.into();
        self
    }

    /// Override the capability probe wait.
    #[must_use]
    pub const fn with_capability_timeout(mut self, timeout: Duration) -> Self {
        self.capability_timeout = timeout;
        self
    }

    /// Set the compile pass arguments.
    #[must_use]
    pub fn with_compile_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.compile_args = args.into_iter().collect();
        self
    }

    /// Override the compile budget.
    #[must_use]
    pub const fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    /// Override the compile poll interval.
    #[must_use]
    pub const fn with_compile_poll_interval(mut self, interval: Duration) -> Self {
        self.compile_poll_interval = interval;
        self
    }

    /// Set the entry-point resource path.
    #[must_use]
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    /// Append extra pass-through launch parameters.
    #[must_use]
    pub fn with_launch_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.launch_args.extend(args);
        self
    }

    /// Override the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn bridge_target(&self) -> PathBuf {
        self.workspace.join(&self.bridge_path)
    }
}

/// Supervises one external runtime process.
pub struct RuntimeSupervisor {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    // The child handle and the cancellation token are the only state
    // touched from more than one call path (normal shutdown vs. hard
    // cancel); both paths go through this one lock.
    child: tokio::sync::Mutex<Option<Child>>,
    cancellation: CancellationToken,
    debugger: Option<Arc<dyn DebuggerHook>>,
    installed_bridge: AtomicBool,
    kill_attempts: AtomicUsize,
}

impl RuntimeSupervisor {
    /// Create a supervisor in the `NotStarted` state.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SupervisorState::NotStarted),
            child: tokio::sync::Mutex::new(None),
            cancellation: CancellationToken::new(),
            debugger: None,
            installed_bridge: AtomicBool::new(false),
            kill_attempts: AtomicUsize::new(0),
        }
    }

    /// Attach a debugger hook invoked after launch.
    #[must_use]
    pub fn with_debugger(mut self, hook: Arc<dyn DebuggerHook>) -> Self {
        self.debugger = Some(hook);
        self
    }

    /// Current state machine position.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("supervisor state lock poisoned")
    }

    /// Token observed by the launch sequence; `cancel` trips it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Process-kill attempts issued so far (diagnostics).
    #[must_use]
    pub fn kill_attempts(&self) -> usize {
        self.kill_attempts.load(Ordering::Acquire)
    }

    fn set_state(&self, state: SupervisorState) {
        let mut guard = self.state.lock().expect("supervisor state lock poisoned");
        debug!(from = %*guard, to = %state, "supervisor state transition");
        *guard = state;
    }

    fn check_cancelled(&self) -> Result<(), SupervisorError> {
        if self.cancellation.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        Ok(())
    }

    /// Full launch sequence: capability probe, bridge install, compile,
    /// run. On error the supervisor is left in the state that failed;
    /// callers are expected to drive it to `Closed` via [`Self::shutdown`].
    ///
    /// # Errors
    ///
    /// Any [`SupervisorError`]; all of them abort the run.
    pub async fn launch(&self) -> Result<u32, SupervisorError> {
        self.verify_capability().await?;
        self.install_bridge()?;
        self.compile().await?;
        self.start().await
    }

    /// Probe the binary's help output for the required capability flag.
    ///
    /// # Errors
    ///
    /// `CapabilityMissing` with a remediation message when the flag is
    /// absent, `CapabilityTimeout` when the probe exceeds its bounded
    /// wait, `SpawnFailed` when the binary cannot run at all.
    pub async fn verify_capability(&self) -> Result<(), SupervisorError> {
        self.check_cancelled()?;
        self.set_state(SupervisorState::VerifyingCapability);

        let binary = self.config.binary.display().to_string();
        let mut probe = Command::new(&self.config.binary);
        probe
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.capability_timeout, probe.output()).await
        {
            Err(_elapsed) => {
                return Err(SupervisorError::CapabilityTimeout {
                    binary,
                    timeout: self.config.capability_timeout,
                })
            }
            Ok(Err(error)) => return Err(SupervisorError::SpawnFailed(error.to_string())),
            Ok(Ok(output)) => output,
        };

        let help = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !help.contains(&self.config.capability_flag) {
            return Err(SupervisorError::CapabilityMissing {
                binary,
                flag: self.config.capability_flag.clone(),
            });
        }

        debug!(flag = %self.config.capability_flag, "capability probe passed");
        Ok(())
    }

    /// Idempotently materialize the launcher resource into the
    /// workspace.
    ///
    /// # Errors
    ///
    /// `BridgeInstall` when the resource cannot be written.
    pub fn install_bridge(&self) -> Result<(), SupervisorError> {
        self.check_cancelled()?;
        self.set_state(SupervisorState::InstallingBridge);

        let target = self.config.bridge_target();
        if target.exists() {
            debug!(path = %target.display(), "launcher resource already present");
            return Ok(());
        }

        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, BRIDGE_RESOURCE)
        };
        write(&target).map_err(|source| SupervisorError::BridgeInstall {
            path: target.display().to_string(),
            source,
        })?;

        self.installed_bridge.store(true, Ordering::Release);
        info!(path = %target.display(), "launcher resource installed");
        Ok(())
    }

    /// Run the headless compile pass, polling for completion on the
    /// fixed interval up to the configured budget. Skipped when no
    /// compile arguments are configured.
    ///
    /// # Errors
    ///
    /// `CompileFailed` on a non-zero exit, `CompileTimedOut` when the
    /// budget is exceeded (the pass is force-killed), `SpawnFailed` when
    /// the compiler cannot start. Either failure deletes a
    /// freshly-installed launcher resource so the next run retries the
    /// install cleanly.
    pub async fn compile(&self) -> Result<(), SupervisorError> {
        if self.config.compile_args.is_empty() {
            debug!("no compile arguments configured; skipping compile pass");
            return Ok(());
        }
        self.check_cancelled()?;
        self.set_state(SupervisorState::Compiling);

        let mut child = Command::new(&self.config.binary)
            .args(&self.config.compile_args)
            .current_dir(&self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| SupervisorError::SpawnFailed(error.to_string()))?;

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_lines(stdout, Arc::clone(&diagnostics)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_lines(stderr, Arc::clone(&diagnostics)));
        }

        let deadline = tokio::time::Instant::now() + self.config.compile_timeout;
        let status = loop {
            if self.cancellation.is_cancelled() {
                let _ = child.start_kill();
                self.cleanup_bridge();
                return Err(SupervisorError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("compile step exceeded its budget; force-killing");
                        let _ = child.start_kill();
                        self.log_compile_diagnostics(&diagnostics);
                        self.cleanup_bridge();
                        return Err(SupervisorError::CompileTimedOut(
                            self.config.compile_timeout,
                        ));
                    }
                    tokio::time::sleep(self.config.compile_poll_interval).await;
                }
                Err(error) => {
                    return Err(SupervisorError::SpawnFailed(error.to_string()));
                }
            }
        };

        if !status.success() {
            self.log_compile_diagnostics(&diagnostics);
            self.cleanup_bridge();
            return Err(SupervisorError::CompileFailed {
                code: status.code(),
            });
        }

        info!("compile pass completed");
        Ok(())
    }

    /// Launch the runtime with output redirection and the optional
    /// debugger hook.
    ///
    /// # Errors
    ///
    /// `SpawnFailed` when the runtime cannot start, `DebuggerAttach`
    /// when the hook rejects the attach (the child is torn down first).
    pub async fn start(&self) -> Result<u32, SupervisorError> {
        self.check_cancelled()?;
        self.set_state(SupervisorState::Running);

        let mut command = Command::new(&self.config.binary);
        if let Some(entry_point) = &self.config.entry_point {
            command.arg(entry_point);
        }
        let mut child = command
            .args(&self.config.launch_args)
            .current_dir(&self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|error| SupervisorError::SpawnFailed(error.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::SpawnFailed("failed to get process ID".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        *self.child.lock().await = Some(child);
        info!(pid, binary = %self.config.binary.display(), "runtime process launched");

        if let Some(debugger) = &self.debugger {
            if let Err(reason) = debugger.attach(pid) {
                warn!(pid, %reason, "debugger attach rejected; tearing runtime down");
                self.shutdown().await;
                return Err(SupervisorError::DebuggerAttach(reason));
            }
            info!(pid, "debugger attached");
        }

        Ok(pid)
    }

    /// Kill the runtime and reach `Closed`. Safe to call from any state
    /// and any number of times; only the first call with a live child
    /// issues a kill.
    pub async fn shutdown(&self) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            debug!("supervisor already closed");
            self.set_state(SupervisorState::Closed);
            return;
        };

        self.set_state(SupervisorState::Exiting);
        let pid = child.id();
        self.kill_attempts.fetch_add(1, Ordering::AcqRel);

        if let Err(error) = child.start_kill() {
            warn!(%error, "kill signal failed; process may already be gone");
        }

        match tokio::time::timeout(self.config.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "runtime process exited"),
            Ok(Err(error)) => warn!(%error, "failed to reap runtime process"),
            Err(_elapsed) => {
                warn!(
                    grace = ?self.config.shutdown_grace,
                    "runtime did not exit within the grace period; proceeding"
                );
                // Unconditional OS-level kill for a child that survived
                // the handle-based kill.
                #[cfg(unix)]
                if let Some(pid) = pid {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    #[allow(clippy::cast_possible_wrap)]
                    let target = Pid::from_raw(pid as i32);
                    let _ = kill(target, Signal::SIGKILL);
                }
            }
        }

        self.set_state(SupervisorState::Closed);
    }

    /// Hard cancel: trips the cancellation token and kills the managed
    /// process regardless of cooperative state. Shares the child lock
    /// with [`Self::shutdown`], so the two paths cannot double-kill.
    pub async fn cancel(&self) {
        self.cancellation.cancel();
        self.shutdown().await;
    }

    /// Delete a launcher resource that this run materialized, so the
    /// next run retries the install cleanly. Pre-existing resources are
    /// left alone.
    fn cleanup_bridge(&self) {
        if self.installed_bridge.swap(false, Ordering::AcqRel) {
            let target = self.config.bridge_target();
            if let Err(error) = std::fs::remove_file(&target) {
                warn!(path = %target.display(), %error, "failed to remove launcher resource");
            } else {
                info!(path = %target.display(), "removed freshly-installed launcher resource");
            }
        }
    }

    fn log_compile_diagnostics(&self, diagnostics: &Arc<Mutex<Vec<String>>>) {
        let lines = diagnostics
            .lock()
            .expect("compile diagnostics lock poisoned");
        for line in lines.iter() {
            warn!(target: "gantry_host::compile", "{line}");
        }
    }
}

/// Forward one child stream to the logger, line by line.
async fn forward_lines(stream: impl tokio::io::AsyncRead + Unpin, label: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "gantry_host::runtime", stream = label, "{line}");
    }
}

/// Collect one child stream into a shared buffer for later diagnostics.
async fn collect_lines(stream: impl tokio::io::AsyncRead + Unpin, sink: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.lock().expect("compile diagnostics lock poisoned").push(line);
    }
}
