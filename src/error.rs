//! Errors that escape the process subsystem.
//!
//! Only spawn and kill failures propagate. Everything else (degraded
//! tracking, read errors, wait timeouts) is absorbed into state and reported
//! through [`crate::diagnostics`].
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to start the requested program. No process exists afterwards.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {}", program.display())]
    NotFound { program: PathBuf, source: io::Error },

    #[error("executable is not runnable: {}", program.display())]
    PermissionDenied { program: PathBuf, source: io::Error },

    #[error("failed to spawn {}: {source}", program.display())]
    Os { program: PathBuf, source: io::Error },

    #[error("failed to set up the output pipe: {source}")]
    Pipe { source: io::Error },

    #[error("spawned {} but the OS reported no pid", program.display())]
    NoPid { program: PathBuf },
}

impl SpawnError {
    /// Classify an `io::Error` returned by `Command::spawn`.
    pub(crate) fn from_spawn(program: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound { program, source },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { program, source },
            _ => SpawnError::Os { program, source },
        }
    }
}

/// A termination primitive failed for a reason other than "already exited".
#[derive(Debug, Error)]
pub enum KillError {
    #[error("permission denied signalling process group {pgid}")]
    GroupPermissionDenied { pgid: i32 },

    #[error("failed to signal process group {pgid}: {source}")]
    Group { pgid: i32, source: io::Error },

    #[error("failed to terminate job object of process {pid}: {source}")]
    Job { pid: u32, source: io::Error },

    #[error("failed to kill process {pid}: {source}")]
    Root { pid: u32, source: io::Error },
}

/// Errors returned by [`crate::supervisor::ProcessSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Kill(#[from] KillError),

    #[error("supervisor is already running process {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("no process has been started")]
    NotStarted,

    #[error("failed to open output log {}: {source}", path.display())]
    Sink { path: PathBuf, source: io::Error },
}
