//! Handle and state for one spawned process tree.
//!
//! A `ManagedProcess` is pure state: the root pid, the tracking primitive it
//! owns, the output stream until the supervisor takes it, and the terminal
//! status once one is recorded. The transitions themselves are driven by
//! [`crate::controller::ProcessGroupController`].
use crate::pump::OutputStream;
use serde::Serialize;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// Exit code recorded when the controller terminated the tree.
///
/// Real exit codes are non-negative and signal deaths not caused by the
/// controller are reported as `-signal`, so this value always means
/// "killed by us" for a process that was running when `kill` was called.
pub const KILLED_EXIT_CODE: i32 = -9;

/// Recorded when the OS could not report a status for the root process.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// How the descendants of the root process are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tracking {
    /// POSIX process group; pgid == root pid.
    ProcessGroup,
    /// Windows job object with a completion-port monitor.
    JobObject,
    /// Root process only.
    Untracked,
}

impl std::fmt::Display for Tracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tracking::ProcessGroup => "process-group",
            Tracking::JobObject => "job-object",
            Tracking::Untracked => "untracked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// The tracked unit drained on its own; holds the root's exit code.
    Exited(i32),
    /// Terminated by the controller.
    Killed,
}

/// The OS resource addressing the whole tree.
pub(crate) enum GroupToken {
    #[cfg(unix)]
    ProcessGroup(nix::unistd::Pid),
    #[cfg(windows)]
    Job(crate::controller::job::JobObject),
    /// Root-only tracking, or a token already released.
    Root,
}

pub struct ManagedProcess {
    pub(crate) pid: u32,
    pub(crate) token: GroupToken,
    pub(crate) child: Child,
    /// Root exit code once reaped; the tree may still be draining.
    pub(crate) root_exit: Option<i32>,
    tracking: Tracking,
    degraded: Option<String>,
    started_at: Instant,
    output: Option<OutputStream>,
    state: ProcessState,
}

impl ManagedProcess {
    pub(crate) fn new(
        pid: u32,
        child: Child,
        token: GroupToken,
        tracking: Tracking,
        degraded: Option<String>,
        output: OutputStream,
    ) -> Self {
        Self {
            pid,
            token,
            child,
            root_exit: None,
            tracking,
            degraded,
            started_at: Instant::now(),
            output: Some(output),
            state: ProcessState::Running,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tracking(&self) -> Tracking {
        self.tracking
    }

    /// Why tree tracking fell back to root-only, when it was requested.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The process-group id, while the group token is held.
    #[cfg(unix)]
    pub fn group_id(&self) -> Option<i32> {
        match self.token {
            GroupToken::ProcessGroup(pgid) => Some(pgid.as_raw()),
            GroupToken::Root => None,
        }
    }

    /// True while a group or job token for the whole tree is held.
    ///
    /// False for root-only tracking and once a terminal state released it.
    pub fn holds_tree_token(&self) -> bool {
        !matches!(self.token, GroupToken::Root)
    }

    /// True while the root process has not exited and no terminal state is
    /// recorded.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcessState::Running || self.root_exit.is_some() {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// The terminal exit code; `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ProcessState::Running => None,
            ProcessState::Exited(code) => Some(code),
            ProcessState::Killed => Some(KILLED_EXIT_CODE),
        }
    }

    /// Hand the combined output stream to a reader. Only the first call
    /// returns it.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Record a terminal state once and release the group token.
    ///
    /// Later calls leave the first recorded state in place and return its
    /// exit code.
    pub(crate) fn settle(&mut self, state: ProcessState) -> i32 {
        if let Some(code) = self.exit_code() {
            return code;
        }
        self.state = state;
        self.release();
        self.exit_code().unwrap_or(UNKNOWN_EXIT_CODE)
    }

    fn release(&mut self) {
        let token = std::mem::replace(&mut self.token, GroupToken::Root);
        drop(token);
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("tracking", &self.tracking)
            .field("holds_tree_token", &self.holds_tree_token())
            .field("state", &self.state)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.state != ProcessState::Running {
            return;
        }
        // The child itself has kill_on_drop; reach the rest of the group too.
        // A job object kills its members when its handle closes.
        #[cfg(unix)]
        if let GroupToken::ProcessGroup(pgid) = self.token {
            tracing::debug!(pgid = pgid.as_raw(), "dropping running process group; killing it");
            let _ = crate::controller::posix::kill_group(pgid);
        }
    }
}

/// Map an OS exit status onto the single integer this crate reports.
#[cfg(unix)]
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

#[cfg(not(unix))]
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_EXIT_CODE)
}
