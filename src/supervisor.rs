//! Run one program to completion under overall and output-idle deadlines.
//!
//! The supervisor owns at most one [`ManagedProcess`] at a time. `run` starts
//! it, `wait_for_finish` pumps its combined output line by line until the
//! stream closes or a deadline passes, kills the tree on timeout and reaps it
//! with a bounded wait.
use crate::controller::{ProcessGroupController, SpawnRequest, WaitStatus};
use crate::diagnostics::{Diagnostic, Diagnostics, NoopDiagnostics};
use crate::error::{KillError, SupervisorError};
use crate::managed::{ManagedProcess, ProcessState, UNKNOWN_EXIT_CODE};
use crate::pump::{OutputPump, OutputStream};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use crate::controller::DEFAULT_REAP_TIMEOUT;

/// Lifecycle of the supervisor's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    NormalExit,
    TimedOut,
    Killed,
    SpawnFailed,
}

/// Per-run callbacks. Every method defaults to a no-op.
///
/// Exactly one of `on_timeout` / `on_finish` fires per `wait_for_finish`,
/// after the output is drained and before the final reap.
pub trait RunHooks {
    /// Called for every output line, trailing line terminator removed.
    fn on_output_line(&mut self, _line: &str) {}
    /// Called after the tree was killed for exceeding a deadline.
    fn on_timeout(&mut self) {}
    /// Called when the run ended without a timeout.
    fn on_finish(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl RunHooks for NoHooks {}

/// Where output lines go besides the hooks and the in-memory store.
pub enum OutputSink<'a> {
    None,
    /// Append raw lines, terminators included, to this file.
    File(PathBuf),
    /// Pass each stripped line to a callback.
    Lines(Box<dyn FnMut(&str) + Send + 'a>),
}

impl<'a> OutputSink<'a> {
    pub fn lines(callback: impl FnMut(&str) + Send + 'a) -> Self {
        OutputSink::Lines(Box::new(callback))
    }
}

impl std::fmt::Debug for OutputSink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::None => f.write_str("None"),
            OutputSink::File(path) => f.debug_tuple("File").field(path).finish(),
            OutputSink::Lines(_) => f.write_str("Lines(..)"),
        }
    }
}

/// An opened sink. A file whose write fails is dropped and not retried.
enum SinkWriter<'a> {
    None,
    File { path: PathBuf, file: File },
    Lines(Box<dyn FnMut(&str) + Send + 'a>),
}

impl<'a> SinkWriter<'a> {
    fn open(sink: OutputSink<'a>) -> Result<Self, SupervisorError> {
        Ok(match sink {
            OutputSink::None => SinkWriter::None,
            OutputSink::Lines(callback) => SinkWriter::Lines(callback),
            OutputSink::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|source| SupervisorError::Sink {
                        path: path.clone(),
                        source,
                    })?;
                SinkWriter::File { path, file }
            }
        })
    }

    fn write(&mut self, raw: &str, line: &str) {
        match self {
            SinkWriter::None => {}
            SinkWriter::Lines(callback) => callback(line),
            SinkWriter::File { path, file } => {
                if let Err(e) = file.write_all(raw.as_bytes()) {
                    warn!(path = %path.display(), error = %e, "output log write failed; disabling it");
                    *self = SinkWriter::None;
                }
            }
        }
    }
}

/// The shorter of two optional limits; `None` only when both are absent.
fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub struct ProcessSupervisor<H: RunHooks = NoHooks> {
    controller: ProcessGroupController,
    diagnostics: Arc<dyn Diagnostics>,
    hooks: H,
    reap_timeout: Duration,
    process: Option<ManagedProcess>,
    pump: Option<OutputPump<OutputStream>>,
    stored_output: Vec<String>,
    lines_seen: u64,
    state: RunState,
    exit_code: Option<i32>,
    timed_out: bool,
}

impl ProcessSupervisor<NoHooks> {
    pub fn new() -> Self {
        Self::with_hooks(NoHooks)
    }
}

impl Default for ProcessSupervisor<NoHooks> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: RunHooks> ProcessSupervisor<H> {
    pub fn with_hooks(hooks: H) -> Self {
        let diagnostics: Arc<dyn Diagnostics> = Arc::new(NoopDiagnostics);
        Self {
            controller: ProcessGroupController::new(diagnostics.clone()),
            diagnostics,
            hooks,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
            process: None,
            pump: None,
            stored_output: Vec::new(),
            lines_seen: 0,
            state: RunState::Idle,
            exit_code: None,
            timed_out: false,
        }
    }

    /// Route controller and supervisor diagnostics to `diagnostics`.
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.controller = ProcessGroupController::new(diagnostics.clone());
        self.diagnostics = diagnostics;
        self
    }

    /// Bound on the final wait of every run.
    pub fn reap_timeout(mut self, reap_timeout: Duration) -> Self {
        self.reap_timeout = reap_timeout;
        self
    }

    /// Start a new run. Refused while the previous run is still in progress.
    pub fn run(&mut self, request: &SpawnRequest) -> Result<u32, SupervisorError> {
        if self.state == RunState::Running {
            let pid = self.process.as_ref().map(ManagedProcess::pid).unwrap_or_default();
            return Err(SupervisorError::AlreadyRunning { pid });
        }

        self.process = None;
        self.pump = None;
        self.stored_output.clear();
        self.lines_seen = 0;
        self.exit_code = None;
        self.timed_out = false;

        let mut process = match self.controller.spawn(request) {
            Ok(process) => process,
            Err(e) => {
                warn!(program = %request.program.display(), error = %e, "spawn failed");
                self.state = RunState::SpawnFailed;
                return Err(e.into());
            }
        };

        let pid = process.pid();
        self.pump = process.take_output().map(OutputPump::new);
        self.process = Some(process);
        self.state = RunState::Running;
        Ok(pid)
    }

    /// Drive the current run to completion and return its exit code.
    ///
    /// `overall` bounds wall time since spawn, `idle` bounds the gap between
    /// lines; either may be absent. When one passes, the tree is killed and
    /// the code is [`crate::KILLED_EXIT_CODE`]. With `store_output`, every
    /// stripped line is kept for [`Self::stored_output`].
    ///
    /// Calling this again after it returned yields the recorded code.
    pub async fn wait_for_finish(
        &mut self,
        overall: Option<Duration>,
        idle: Option<Duration>,
        store_output: bool,
        sink: OutputSink<'_>,
    ) -> Result<i32, SupervisorError> {
        let Some(process) = self.process.as_mut() else {
            return Err(SupervisorError::NotStarted);
        };
        let Some(mut pump) = self.pump.take() else {
            return Ok(self
                .exit_code
                .or_else(|| process.exit_code())
                .unwrap_or(UNKNOWN_EXIT_CODE));
        };
        let pid = process.pid();

        let mut sink = match SinkWriter::open(sink) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(pid, error = %e, "cannot open output sink; killing process");
                let _ = self.controller.kill(process);
                let code = match self.controller.wait(process, Some(self.reap_timeout)).await {
                    WaitStatus::Exited(code) => code,
                    WaitStatus::TimedOut => process.exit_code().unwrap_or(UNKNOWN_EXIT_CODE),
                };
                self.exit_code = Some(code);
                self.state = RunState::Killed;
                return Err(e);
            }
        };

        let deadline = overall.map(|limit| process.started_at() + limit);
        let remaining = || deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        // Idle time counts from the last line, or from here before the first.
        let mut last_output = Instant::now();
        let idle_left = |last_output: Instant| {
            idle.map(|idle| (last_output + idle).saturating_duration_since(Instant::now()))
        };
        let mut timed_out = false;

        // A tree already killed through `kill()` is not read further; with
        // untracked descendants holding the pipe, end of stream may never come.
        if process.state() == ProcessState::Running {
            loop {
                let budget = remaining();
                if budget == Some(Duration::ZERO) {
                    debug!(pid, "overall timeout exhausted while reading output");
                    timed_out = true;
                    break;
                }
                let limit = earliest(budget, idle_left(last_output));

                let (raw, read_timed_out) = pump.read_line(limit).await;
                if read_timed_out {
                    debug!(pid, ?limit, "no output within the read timeout");
                    timed_out = true;
                    break;
                }
                if raw.is_empty() {
                    break;
                }

                last_output = Instant::now();
                let line = raw.trim_end_matches(['\r', '\n']);
                self.lines_seen += 1;
                if store_output {
                    self.stored_output.push(line.to_string());
                }
                sink.write(&raw, line);
                self.hooks.on_output_line(line);
            }

            if let Some(e) = pump.take_read_error() {
                self.diagnostics.emit(&Diagnostic::ReadError {
                    pid,
                    message: e.to_string(),
                });
            }

            // Output closed; the root may still be running. It stays bound by
            // both deadlines: a silent root is as idle as a silent stream.
            if !timed_out && process.state() == ProcessState::Running {
                let limit = earliest(remaining(), idle_left(last_output));
                if let WaitStatus::TimedOut = self.controller.wait(process, limit).await {
                    debug!(pid, ?limit, "timed out waiting for exit after output closed");
                    timed_out = true;
                }
            }
        }
        drop(sink);

        let mut kill_error: Option<KillError> = None;
        if timed_out {
            self.timed_out = true;
            warn!(pid, elapsed_ms = process.elapsed().as_millis() as u64, "timed out; killing process tree");
            if let Err(e) = self.controller.kill(process) {
                warn!(pid, error = %e, "killing timed-out process tree failed");
                kill_error = Some(e);
            }
            self.hooks.on_timeout();
        } else {
            self.hooks.on_finish();
        }

        let code = match self.controller.wait(process, Some(self.reap_timeout)).await {
            WaitStatus::Exited(code) => code,
            WaitStatus::TimedOut => {
                warn!(pid, reap_timeout = ?self.reap_timeout, "process not reaped in time");
                self.diagnostics.emit(&Diagnostic::ReapTimedOut { pid });
                process
                    .exit_code()
                    .or(process.root_exit)
                    .unwrap_or(UNKNOWN_EXIT_CODE)
            }
        };

        self.exit_code = Some(code);
        self.state = if timed_out {
            RunState::TimedOut
        } else if process.state() == ProcessState::Killed {
            RunState::Killed
        } else {
            RunState::NormalExit
        };
        info!(
            pid,
            exit_code = code,
            state = ?self.state,
            lines = self.lines_seen,
            "run finished"
        );

        match kill_error {
            Some(e) => Err(e.into()),
            None => Ok(code),
        }
    }

    /// Kill the current tree. `None` when nothing was started.
    ///
    /// Repeated calls return the same code.
    pub fn kill(&mut self) -> Result<Option<i32>, KillError> {
        let Some(process) = self.process.as_mut() else {
            return Ok(None);
        };
        let code = self.controller.kill(process)?;
        if self.state == RunState::Running {
            self.state = RunState::Killed;
        }
        self.exit_code.get_or_insert(code);
        Ok(self.exit_code)
    }

    /// True while the root process of the current run is alive.
    pub fn is_running(&mut self) -> bool {
        self.state == RunState::Running && self.process.as_mut().is_some_and(ManagedProcess::is_alive)
    }

    /// The recorded exit code, once the run reached a terminal state.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stored_output(&self) -> &[String] {
        &self.stored_output
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn process(&self) -> Option<&ManagedProcess> {
        self.process.as_ref()
    }

    /// Lines read during the current run, stored or not.
    pub fn line_count(&self) -> u64 {
        self.lines_seen
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}
