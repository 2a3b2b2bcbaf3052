//! Caller-visible diagnostics.
//!
//! Conditions that are not errors but that a caller may want to know about
//! (tree tracking unavailable, output stream broken) are reported through a
//! [`Diagnostics`] sink injected at construction. The default sink discards
//! everything.
use std::fmt;
use std::sync::Mutex;

/// A recorded, non-fatal condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Tracking was not requested: only the root process will be killed.
    DescendantsUntracked { pid: u32 },
    /// Tracking was requested but the group/job primitive could not be set up.
    TrackingDegraded { pid: u32, reason: String },
    /// The output stream failed before end of file; treated as closed.
    ReadError { pid: u32, message: String },
    /// The bounded wait after a kill elapsed before the root was reaped.
    ReapTimedOut { pid: u32 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DescendantsUntracked { pid } => {
                write!(f, "process {pid}: descendants are not tracked and will not be killed")
            }
            Diagnostic::TrackingDegraded { pid, reason } => {
                write!(
                    f,
                    "process {pid}: tree tracking unavailable ({reason}); only the root will be killed"
                )
            }
            Diagnostic::ReadError { pid, message } => {
                write!(f, "process {pid}: output stream failed: {message}")
            }
            Diagnostic::ReapTimedOut { pid } => {
                write!(f, "process {pid}: not reaped within the reap timeout after kill")
            }
        }
    }
}

/// Receives diagnostics from the controller and supervisor.
pub trait Diagnostics: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

/// Discards every diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {
    fn emit(&self, _diagnostic: &Diagnostic) {}
}

/// Forwards diagnostics to `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn emit(&self, diagnostic: &Diagnostic) {
        tracing::warn!(%diagnostic, "process diagnostic");
    }
}

/// Keeps every diagnostic in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    seen: Mutex<Vec<Diagnostic>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn recorded(&self) -> Vec<Diagnostic> {
        match self.seen.lock() {
            Ok(seen) => seen.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn emit(&self, diagnostic: &Diagnostic) {
        match self.seen.lock() {
            Ok(mut seen) => seen.push(diagnostic.clone()),
            Err(poisoned) => poisoned.into_inner().push(diagnostic.clone()),
        }
    }
}
