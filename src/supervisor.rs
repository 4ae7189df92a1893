//! Child process supervision for `supervised-run`.
//!
//! The supervisor launches the application as a child, forwards its output
//! to the log sink and reports the end of the child's life exactly once, no
//! matter whether it exited on its own, was stopped, or never launched.

use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::launch::LaunchSpec;
use crate::log_sink::BufferedLogSink;
use crate::platform::{self, ConsoleSignal};
use crate::settings::ServiceSettings;

/// How long a child gets to react to the console interrupt before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Why a supervision cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The child exited on its own; `None` when killed by a signal.
    ChildExited(Option<i32>),
    /// `stop` was called while the child was running.
    StopRequested,
    /// The child could not be spawned.
    LaunchFailed(String),
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        match self {
            StopReason::ChildExited(code) => *code != Some(0),
            StopReason::StopRequested => false,
            StopReason::LaunchFailed(_) => true,
        }
    }

    /// Exit code to report to the service manager.
    pub fn exit_code(&self) -> u32 {
        match self {
            StopReason::ChildExited(Some(code)) => *code as u32,
            StopReason::ChildExited(None) | StopReason::LaunchFailed(_) => 1,
            StopReason::StopRequested => 0,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ChildExited(Some(code)) => write!(f, "child exited with status {code}"),
            StopReason::ChildExited(None) => write!(f, "child terminated by signal"),
            StopReason::StopRequested => write!(f, "stop requested"),
            StopReason::LaunchFailed(err) => write!(f, "child failed to launch: {err}"),
        }
    }
}

/// Coarse lifecycle phase, for callers that only need to observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug)]
enum SupervisorState {
    NotStarted,
    Running {
        pid: u32,
        terminate: Option<oneshot::Sender<()>>,
        finished: Option<oneshot::Receiver<()>>,
    },
    Stopped,
}

struct Inner {
    name: String,
    launch: LaunchSpec,
    sink: Option<Arc<BufferedLogSink>>,
    console: Box<dyn ConsoleSignal>,
    grace: Duration,
    state: Mutex<SupervisorState>,
}

pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    runtime: Runtime,
}

impl ProcessSupervisor {
    /// Supervisor that relaunches this application with the settings' arguments.
    pub fn new(settings: &ServiceSettings) -> Result<Self> {
        let launch = LaunchSpec::relaunch(settings)?;
        Self::with_launch(settings, launch)
    }

    pub fn with_launch(settings: &ServiceSettings, launch: LaunchSpec) -> Result<Self> {
        let sink = settings
            .write_log
            .then(|| Arc::new(BufferedLogSink::new(&settings.log_path)));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("svcwrap-supervisor")
            .enable_all()
            .build()
            .context("failed to build supervisor runtime")?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: settings.name.clone(),
                launch,
                sink,
                console: platform::default_console_signal(),
                grace: DEFAULT_STOP_GRACE,
                state: Mutex::new(SupervisorState::NotStarted),
            }),
            runtime,
        })
    }

    /// Only valid before `start`.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.grace = grace;
        }
        self
    }

    /// Upper bound on how long `stop` blocks for a running child.
    pub fn stop_timeout(&self) -> Duration {
        self.inner.grace + OUTPUT_DRAIN_TIMEOUT
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn phase(&self) -> Phase {
        match &*self.inner.lock_state() {
            SupervisorState::NotStarted => Phase::NotStarted,
            SupervisorState::Running { .. } => Phase::Running,
            SupervisorState::Stopped => Phase::Stopped,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.inner.lock_state() {
            SupervisorState::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Launch the child. `on_stopped` runs exactly once when the cycle ends,
    /// including when the spawn itself fails.
    pub fn start<F>(&self, on_stopped: F)
    where
        F: FnOnce(StopReason) + Send + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if !matches!(*state, SupervisorState::NotStarted) {
            tracing::warn!(service = %inner.name, "supervisor already started; ignoring start");
            return;
        }

        let _enter = self.runtime.enter();
        let (mut child, pid) = match inner.spawn() {
            Ok(spawned) => spawned,
            Err(err) => {
                *state = SupervisorState::Stopped;
                drop(state);

                let message = format!("{err:#}");
                tracing::error!(service = %inner.name, "{message}");
                inner.log(&format!("{} {}", inner.name, message));
                inner.finish(&StopReason::LaunchFailed(message.clone()));
                on_stopped(StopReason::LaunchFailed(message));
                return;
            }
        };

        tracing::info!(service = %inner.name, pid, "{} Started", inner.name);
        inner.log(&format!("{} Started", inner.name));

        let mut forwarders = Vec::new();
        if let Some(sink) = &inner.sink {
            if let Some(stdout) = child.stdout.take() {
                forwarders.push(self.forward(Arc::clone(sink), stdout));
            }
            if let Some(stderr) = child.stderr.take() {
                forwarders.push(self.forward(Arc::clone(sink), stderr));
            }
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        *state = SupervisorState::Running {
            pid,
            terminate: Some(terminate_tx),
            finished: Some(finished_rx),
        };
        drop(state);

        let inner = Arc::clone(inner);
        self.runtime.spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => StopReason::ChildExited(status.code()),
                    Err(err) => {
                        tracing::warn!(service = %inner.name, "failed to wait for child: {err}");
                        StopReason::ChildExited(None)
                    }
                },
                _ = terminate_rx => {
                    inner.terminate(&mut child, pid).await;
                    StopReason::StopRequested
                }
            };

            for mut forwarder in forwarders {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
                    forwarder.abort();
                }
            }

            inner.finish(&reason);
            finished_tx.send(()).ok();
            on_stopped(reason);
        });
    }

    /// Terminate the child if it runs and flush the log.
    ///
    /// Safe before `start`, after the child already exited, and repeatedly.
    /// Must not be called from inside the `on_stopped` callback's runtime
    /// while the child is still running.
    pub fn stop(&self) {
        let finished = {
            let mut state = self.inner.lock_state();
            match &mut *state {
                SupervisorState::NotStarted => {
                    *state = SupervisorState::Stopped;
                    None
                }
                SupervisorState::Running {
                    terminate,
                    finished,
                    ..
                } => {
                    if let Some(tx) = terminate.take() {
                        tx.send(()).ok();
                    }
                    finished.take()
                }
                SupervisorState::Stopped => None,
            }
        };

        if let Some(finished) = finished {
            if futures::executor::block_on(finished).is_err() {
                tracing::debug!(service = %self.inner.name, "supervision task ended early");
            }
        }

        if let Some(sink) = &self.inner.sink {
            if let Err(err) = sink.flush(true) {
                tracing::warn!(service = %self.inner.name, "failed to flush log: {err:#}");
            }
        }
    }

    fn forward<R>(&self, sink: Arc<BufferedLogSink>, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.runtime.spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        sink.write(line.trim_end_matches(['\r', '\n']));
                    }
                    Err(err) => {
                        tracing::debug!("stopped reading child output: {err}");
                        break;
                    }
                }
            }
        })
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.write(message);
        }
    }

    fn spawn(&self) -> Result<(Child, u32)> {
        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args);
        if let Some(dir) = &self.launch.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if self.sink.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", self.launch.program.display()))?;
        let pid = child_pid(child.id())
            .with_context(|| format!("failed to launch {}", self.launch.program.display()))?;
        Ok((child, pid))
    }

    /// Interrupt, wait out the grace period, then kill.
    async fn terminate(&self, child: &mut Child, pid: u32) {
        if let Err(err) = self.console.interrupt(pid) {
            tracing::debug!(service = %self.name, pid, "console interrupt failed: {err:#}");
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(service = %self.name, pid, "child exited after interrupt: {status}");
            }
            Ok(Err(err)) => {
                tracing::warn!(service = %self.name, pid, "failed to wait for child: {err}");
            }
            Err(_) => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(service = %self.name, pid, "failed to kill child: {err}");
                    self.log(&format!("{} failed to terminate child {pid}: {err}", self.name));
                }
            }
        }
    }

    fn finish(&self, reason: &StopReason) {
        *self.lock_state() = SupervisorState::Stopped;

        if let StopReason::ChildExited(_) = reason {
            self.log(&format!("{} {}", self.name, reason));
        }
        self.log(&format!("{} Stopped", self.name));
        tracing::info!(service = %self.name, %reason, "{} Stopped", self.name);

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.flush(true) {
                tracing::warn!(service = %self.name, "failed to flush log: {err:#}");
            }
        }
    }
}

/// A pid of 0 would address the supervisor's own process group.
fn child_pid(id: Option<u32>) -> Result<u32> {
    match id {
        Some(pid) if pid != 0 => Ok(pid),
        _ => anyhow::bail!("child exited before its pid was known"),
    }
}
