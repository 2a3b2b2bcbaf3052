//! Spawning and tearing down a process tree.
//!
//! One controller, three tracking strategies chosen per spawn:
//!
//! - **process group** (unix): the root starts in its own group; kill is one
//!   `killpg(SIGKILL)`, wait lasts until no live member remains.
//! - **job object** (windows): the root joins a job wired to a completion
//!   port; kill is `TerminateJobObject`, wait lasts until the monitor thread
//!   reports zero active processes.
//! - **untracked**: root pid only. Used when tracking is disabled, and as the
//!   degraded fallback when the primitive cannot be created.

#[cfg(windows)]
pub(crate) mod job;
mod pipe;
#[cfg(unix)]
pub(crate) mod posix;

use crate::diagnostics::{Diagnostic, Diagnostics, NoopDiagnostics};
use crate::error::{KillError, SpawnError};
use crate::managed::{exit_code_of, GroupToken, ManagedProcess, ProcessState, Tracking};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Used when `wait` is asked to block forever on an already-killed tree.
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Everything needed to start one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Full environment for the child; `None` inherits the parent's.
    pub env: Option<BTreeMap<String, String>>,
    /// Track and kill descendants as one unit.
    pub track_tree: bool,
}

impl SpawnRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            track_tree: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Replace the inherited environment with exactly `env`.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn track_tree(mut self, track: bool) -> Self {
        self.track_tree = track;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }
        if let Some(ref env) = self.env {
            command.env_clear().envs(env);
        }
        command
    }
}

/// Outcome of [`ProcessGroupController::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    /// The timeout elapsed first. Nothing was changed.
    TimedOut,
}

/// Sets up the tree primitive for a freshly spawned root. An error string
/// degrades the spawn to root-only tracking.
type AttachTree = fn(u32) -> Result<(GroupToken, Tracking), String>;

pub struct ProcessGroupController {
    diagnostics: Arc<dyn Diagnostics>,
    attach_tree: AttachTree,
}

impl Default for ProcessGroupController {
    fn default() -> Self {
        Self::new(Arc::new(NoopDiagnostics))
    }
}

impl ProcessGroupController {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            diagnostics,
            attach_tree: Self::attach_tree,
        }
    }

    /// Start `request.program` with stdout and stderr joined into one stream.
    ///
    /// Must be called from within a tokio runtime. Tracking failures never
    /// fail the spawn; they degrade to root-only tracking and are reported
    /// through the diagnostics sink and [`ManagedProcess::degraded_reason`].
    pub fn spawn(&self, request: &SpawnRequest) -> Result<ManagedProcess, SpawnError> {
        let pipe::CombinedPipe {
            reader,
            stdout,
            stderr,
        } = pipe::combined().map_err(|source| SpawnError::Pipe { source })?;

        // The command owns the parent's copies of the write ends; dropping it
        // at the end of this block lets end-of-stream arrive once the tree
        // closes its own copies.
        let mut child = {
            let mut command = request.command();
            command
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .kill_on_drop(true);
            #[cfg(unix)]
            if request.track_tree {
                command.process_group(0);
            }
            command
                .spawn()
                .map_err(|e| SpawnError::from_spawn(request.program.clone(), e))?
        };

        let Some(pid) = child.id() else {
            return Err(SpawnError::NoPid {
                program: request.program.clone(),
            });
        };

        let output = match pipe::into_stream(reader) {
            Ok(output) => output,
            Err(source) => {
                let _ = child.start_kill();
                return Err(SpawnError::Pipe { source });
            }
        };

        let (token, tracking, degraded) = self.track(pid, request.track_tree);
        info!(
            pid,
            program = %request.program.display(),
            args = ?request.args,
            %tracking,
            "process spawned"
        );
        Ok(ManagedProcess::new(pid, child, token, tracking, degraded, output))
    }

    fn track(&self, pid: u32, track_tree: bool) -> (GroupToken, Tracking, Option<String>) {
        if !track_tree {
            self.diagnostics
                .emit(&Diagnostic::DescendantsUntracked { pid });
            return (GroupToken::Root, Tracking::Untracked, None);
        }

        match (self.attach_tree)(pid) {
            Ok((token, tracking)) => (token, tracking, None),
            Err(reason) => {
                warn!(pid, %reason, "tree tracking unavailable; tracking root process only");
                self.diagnostics.emit(&Diagnostic::TrackingDegraded {
                    pid,
                    reason: reason.clone(),
                });
                (GroupToken::Root, Tracking::Untracked, Some(reason))
            }
        }
    }

    #[cfg(unix)]
    fn attach_tree(pid: u32) -> Result<(GroupToken, Tracking), String> {
        // process_group(0) already ran in the child before exec.
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        Ok((GroupToken::ProcessGroup(pgid), Tracking::ProcessGroup))
    }

    #[cfg(windows)]
    fn attach_tree(pid: u32) -> Result<(GroupToken, Tracking), String> {
        let job = job::JobObject::attach(pid)?;
        Ok((GroupToken::Job(job), Tracking::JobObject))
    }

    #[cfg(not(any(unix, windows)))]
    fn attach_tree(_pid: u32) -> Result<(GroupToken, Tracking), String> {
        Err("no process-tree primitive on this platform".to_string())
    }

    /// Hard-kill the tracked unit. Idempotent.
    ///
    /// A tree that already exited counts as killed. The first successful call
    /// records [`crate::managed::KILLED_EXIT_CODE`]; once any terminal state
    /// is recorded, this returns that state's code without touching the OS.
    pub fn kill(&self, process: &mut ManagedProcess) -> Result<i32, KillError> {
        if let Some(code) = process.exit_code() {
            debug!(pid = process.pid, code, "kill on settled process is a no-op");
            return Ok(code);
        }

        let pid = process.pid;
        match process.token {
            #[cfg(unix)]
            GroupToken::ProcessGroup(pgid) => match posix::kill_group(pgid) {
                Ok(()) => {}
                Err(nix::errno::Errno::EPERM) => {
                    // macOS reports EPERM for a group made only of zombies.
                    if !matches!(process.child.try_wait(), Ok(Some(_))) {
                        return Err(KillError::GroupPermissionDenied {
                            pgid: pgid.as_raw(),
                        });
                    }
                }
                Err(errno) => {
                    return Err(KillError::Group {
                        pgid: pgid.as_raw(),
                        source: errno.into(),
                    })
                }
            },
            #[cfg(windows)]
            GroupToken::Job(ref job) => {
                job.terminate()
                    .map_err(|source| KillError::Job { pid, source })?;
            }
            GroupToken::Root => kill_root(pid, &mut process.child)?,
        }

        let code = process.settle(ProcessState::Killed);
        info!(pid, tracking = %process.tracking(), code, "process tree killed");
        Ok(code)
    }

    /// Wait for the tracked unit to finish, at most `timeout` (`None` blocks).
    ///
    /// Group and job strategies wait until no process of the tree remains;
    /// the untracked strategy waits for the root only. The root is always
    /// reaped. On a killed tree `None` is bounded by [`DEFAULT_REAP_TIMEOUT`].
    pub async fn wait(&self, process: &mut ManagedProcess, timeout: Option<Duration>) -> WaitStatus {
        match process.state() {
            ProcessState::Exited(code) => WaitStatus::Exited(code),
            ProcessState::Killed => self.reap_killed(process, timeout).await,
            ProcessState::Running => self.wait_running(process, timeout).await,
        }
    }

    async fn reap_killed(&self, process: &mut ManagedProcess, timeout: Option<Duration>) -> WaitStatus {
        let code = process.exit_code().unwrap_or(crate::managed::KILLED_EXIT_CODE);
        if process.root_exit.is_some() {
            return WaitStatus::Exited(code);
        }
        let limit = timeout.unwrap_or(DEFAULT_REAP_TIMEOUT);
        if reap_root(process, Some(Instant::now() + limit)).await.is_none() {
            warn!(pid = process.pid, ?limit, "killed process not reaped in time");
            self.diagnostics
                .emit(&Diagnostic::ReapTimedOut { pid: process.pid });
        }
        WaitStatus::Exited(code)
    }

    async fn wait_running(&self, process: &mut ManagedProcess, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|limit| Instant::now() + limit);

        #[cfg(windows)]
        if let GroupToken::Job(ref mut job) = process.token {
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, job.drained()).await.is_err() {
                        return WaitStatus::TimedOut;
                    }
                }
                None => job.drained().await,
            }
        }

        let Some(root_code) = reap_root(process, deadline).await else {
            return WaitStatus::TimedOut;
        };

        #[cfg(unix)]
        if let GroupToken::ProcessGroup(pgid) = process.token {
            if !drain_group(pgid, deadline).await {
                debug!(pgid = pgid.as_raw(), "root exited but group still has members");
                return WaitStatus::TimedOut;
            }
        }

        let code = process.settle(ProcessState::Exited(root_code));
        info!(
            pid = process.pid,
            exit_code = code,
            elapsed_ms = process.elapsed().as_millis() as u64,
            "process tree exited"
        );
        WaitStatus::Exited(code)
    }
}

fn kill_root(pid: u32, child: &mut tokio::process::Child) -> Result<(), KillError> {
    match child.start_kill() {
        Ok(()) => Ok(()),
        // Already reaped.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32) => Ok(()),
        Err(source) => Err(KillError::Root { pid, source }),
    }
}

/// Reap the root process, remembering its code. `None` if the deadline passed.
async fn reap_root(process: &mut ManagedProcess, deadline: Option<Instant>) -> Option<i32> {
    if let Some(code) = process.root_exit {
        return Some(code);
    }
    let result = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, process.child.wait())
            .await
            .ok()?,
        None => process.child.wait().await,
    };
    let code = match result {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(pid = process.pid, error = %e, "failed to collect exit status");
            crate::managed::UNKNOWN_EXIT_CODE
        }
    };
    process.root_exit = Some(code);
    Some(code)
}

/// Poll until the group has no live member. False if the deadline passed.
#[cfg(unix)]
async fn drain_group(pgid: nix::unistd::Pid, deadline: Option<Instant>) -> bool {
    loop {
        if !posix::group_alive(pgid) {
            return true;
        }
        let next = Instant::now() + GROUP_POLL_INTERVAL;
        match deadline {
            Some(deadline) if Instant::now() >= deadline => return false,
            Some(deadline) => tokio::time::sleep_until(next.min(deadline)).await,
            None => tokio::time::sleep_until(next).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingDiagnostics;
    use crate::managed::KILLED_EXIT_CODE;
    use crate::pump::OutputPump;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_spawn_tracked_puts_child_in_own_group() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&SpawnRequest::new("true")).unwrap();

        assert_eq!(process.tracking(), Tracking::ProcessGroup);
        assert_eq!(process.group_id(), Some(process.pid() as i32));
        assert!(process.degraded_reason().is_none());
        assert_eq!(controller.wait(&mut process, None).await, WaitStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_spawn_untracked_emits_diagnostic() {
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let controller = ProcessGroupController::new(diagnostics.clone());
        let mut process = controller
            .spawn(&SpawnRequest::new("true").track_tree(false))
            .unwrap();

        assert_eq!(process.tracking(), Tracking::Untracked);
        assert_eq!(process.group_id(), None);
        assert_eq!(
            diagnostics.recorded(),
            vec![Diagnostic::DescendantsUntracked { pid: process.pid() }]
        );
        controller.wait(&mut process, None).await;
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let controller = ProcessGroupController::default();
        let err = controller
            .spawn(&SpawnRequest::new("nonexistent-binary-xyz"))
            .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_managed_process_debug_names_pid_and_state() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&SpawnRequest::new("true")).unwrap();
        let text = format!("{process:?}");
        assert!(text.contains(&format!("pid: {}", process.pid())));
        assert!(text.contains("Running"));
        controller.wait(&mut process, None).await;
    }

    #[tokio::test]
    async fn test_attach_failure_degrades_to_root_only() {
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let controller = ProcessGroupController {
            diagnostics: diagnostics.clone(),
            attach_tree: |_| Err("tree primitive unavailable".to_string()),
        };
        let mut process = controller
            .spawn(&SpawnRequest::new("sleep").arg("30"))
            .unwrap();

        assert_eq!(process.tracking(), Tracking::Untracked);
        assert_eq!(process.degraded_reason(), Some("tree primitive unavailable"));
        assert!(!process.holds_tree_token());
        assert_eq!(
            diagnostics.recorded(),
            vec![Diagnostic::TrackingDegraded {
                pid: process.pid(),
                reason: "tree primitive unavailable".to_string(),
            }]
        );

        assert_eq!(controller.kill(&mut process).unwrap(), KILLED_EXIT_CODE);
        assert_eq!(
            controller.wait(&mut process, Some(Duration::from_secs(5))).await,
            WaitStatus::Exited(KILLED_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_tree_token_held_until_settled() {
        let controller = ProcessGroupController::default();
        let mut tracked = controller.spawn(&SpawnRequest::new("sleep").arg("30")).unwrap();
        assert!(tracked.holds_tree_token());
        controller.kill(&mut tracked).unwrap();
        assert!(!tracked.holds_tree_token());

        let mut untracked = controller
            .spawn(&SpawnRequest::new("true").track_tree(false))
            .unwrap();
        assert!(!untracked.holds_tree_token());
        controller.wait(&mut untracked, None).await;
    }

    #[tokio::test]
    async fn test_wait_returns_real_exit_code() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&sh("exit 3")).unwrap();

        assert_eq!(controller.wait(&mut process, None).await, WaitStatus::Exited(3));
        assert_eq!(process.exit_code(), Some(3));
        assert!(!process.is_alive());
        // Settled: further waits return the recorded code.
        assert_eq!(
            controller.wait(&mut process, Some(Duration::ZERO)).await,
            WaitStatus::Exited(3)
        );
    }

    #[tokio::test]
    async fn test_wait_reports_foreign_signal_as_negative() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&sh("kill -TERM $$")).unwrap();
        assert_eq!(controller.wait(&mut process, None).await, WaitStatus::Exited(-15));
    }

    #[tokio::test]
    async fn test_wait_timeout_has_no_side_effects() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&SpawnRequest::new("sleep").arg("30")).unwrap();

        let status = controller
            .wait(&mut process, Some(Duration::from_millis(100)))
            .await;
        assert_eq!(status, WaitStatus::TimedOut);
        assert!(process.is_alive());
        assert_eq!(process.exit_code(), None);

        assert_eq!(controller.kill(&mut process).unwrap(), KILLED_EXIT_CODE);
        assert_eq!(
            controller.wait(&mut process, None).await,
            WaitStatus::Exited(KILLED_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&SpawnRequest::new("sleep").arg("30")).unwrap();

        let first = controller.kill(&mut process).unwrap();
        let second = controller.kill(&mut process).unwrap();
        assert_eq!(first, KILLED_EXIT_CODE);
        assert_eq!(first, second);
        assert_eq!(process.state(), ProcessState::Killed);
        assert_eq!(process.group_id(), None, "group token released on kill");
    }

    #[tokio::test]
    async fn test_kill_after_natural_exit_keeps_real_code() {
        let controller = ProcessGroupController::default();
        let mut process = controller.spawn(&sh("exit 4")).unwrap();
        controller.wait(&mut process, None).await;

        assert_eq!(controller.kill(&mut process).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_kill_untracked_exited_but_unreaped_root_is_ok() {
        let controller = ProcessGroupController::default();
        let mut process = controller
            .spawn(&SpawnRequest::new("true").track_tree(false))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(controller.kill(&mut process).unwrap(), KILLED_EXIT_CODE);
        assert_eq!(
            controller.wait(&mut process, Some(Duration::from_secs(5))).await,
            WaitStatus::Exited(KILLED_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_one_stream() {
        let controller = ProcessGroupController::default();
        let mut process = controller
            .spawn(&sh("echo out; echo err 1>&2; echo out2"))
            .unwrap();
        let mut pump = OutputPump::new(process.take_output().unwrap());
        assert!(process.take_output().is_none());

        let mut lines = Vec::new();
        loop {
            let (line, timed_out) = pump.read_line(Some(Duration::from_secs(5))).await;
            assert!(!timed_out);
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        assert_eq!(lines, vec!["out\n", "err\n", "out2\n"]);
        assert_eq!(controller.wait(&mut process, None).await, WaitStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_spawn_applies_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        env.insert("PROCWARDEN_MARKER".to_string(), "marker-value".to_string());

        let controller = ProcessGroupController::default();
        let mut process = controller
            .spawn(
                &sh("echo \"$PROCWARDEN_MARKER\"; pwd; echo \"${HOME:-unset}\"")
                    .current_dir(dir.path())
                    .env(env),
            )
            .unwrap();
        let mut pump = OutputPump::new(process.take_output().unwrap());

        let timeout = Some(Duration::from_secs(5));
        assert_eq!(pump.read_line(timeout).await.0, "marker-value\n");
        let cwd = pump.read_line(timeout).await.0;
        assert_eq!(
            std::fs::canonicalize(cwd.trim_end()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(pump.read_line(timeout).await.0, "unset\n");
        controller.wait(&mut process, None).await;
    }

    #[tokio::test]
    async fn test_drop_running_group_kills_it() {
        let controller = ProcessGroupController::default();
        let process = controller.spawn(&SpawnRequest::new("sleep").arg("30")).unwrap();
        let pgid = nix::unistd::Pid::from_raw(process.pid() as i32);

        drop(process);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while posix::group_alive(pgid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!posix::group_alive(pgid));
    }
}
