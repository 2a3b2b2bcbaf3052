//! Managed child processes: spawn a program with its descendants tracked as
//! one unit, read its combined output line by line under overall and idle
//! deadlines, and hard-kill the whole tree when a deadline passes.
//!
//! ```no_run
//! use procwarden::{OutputSink, ProcessSupervisor, SpawnRequest};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), procwarden::SupervisorError> {
//! let mut supervisor = ProcessSupervisor::new();
//! supervisor.run(&SpawnRequest::new("make").arg("test"))?;
//! let code = supervisor
//!     .wait_for_finish(Some(Duration::from_secs(600)), Some(Duration::from_secs(60)), true, OutputSink::None)
//!     .await?;
//! println!("exit {code}, {} lines", supervisor.stored_output().len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod managed;
pub mod pump;
pub mod report;
pub mod supervisor;

pub use controller::{ProcessGroupController, SpawnRequest, WaitStatus, DEFAULT_REAP_TIMEOUT};
pub use diagnostics::{Diagnostic, Diagnostics, NoopDiagnostics, RecordingDiagnostics, TracingDiagnostics};
pub use error::{KillError, SpawnError, SupervisorError};
pub use managed::{ManagedProcess, ProcessState, Tracking, KILLED_EXIT_CODE, UNKNOWN_EXIT_CODE};
pub use pump::{OutputPump, OutputStream};
pub use supervisor::{NoHooks, OutputSink, ProcessSupervisor, RunHooks, RunState};
