//! Windows job objects wired to an I/O completion port.
//!
//! The root process is assigned to a fresh job. A monitor thread drains the
//! job's completion port and sends one message when the job reports zero
//! active processes; the waiter receives it with a timeout.
#![allow(unsafe_code)]

use std::ffi::c_void;
use std::io;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use windows::core::{HRESULT, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
    JobObjectExtendedLimitInformation, SetInformationJobObject, TerminateJobObject,
    JOBOBJECT_ASSOCIATE_COMPLETION_PORT, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};
use windows::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};

const JOB_COMPLETION_KEY: usize = 1;

const MSG_ACTIVE_PROCESS_ZERO: u32 = 4;
const MSG_NEW_PROCESS: u32 = 6;
const MSG_EXIT_PROCESS: u32 = 7;
const MSG_ABNORMAL_EXIT_PROCESS: u32 = 8;

const ERROR_ABANDONED_WAIT_0: u32 = 735;
const INFINITE: u32 = u32::MAX;

/// STATUS_CONTROL_C_EXIT, what the job's processes report after termination.
const TERMINATED_EXIT_CODE: u32 = 0xC000_013A;

struct OwnedHandle(HANDLE);

// Kernel handles may be used and closed from any thread.
unsafe impl Send for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct PortHandle(HANDLE);

unsafe impl Send for PortHandle {}

pub(crate) struct JobObject {
    // Field order matters: the job closes (killing stragglers) before the
    // port, whose closing ends the monitor thread.
    job: OwnedHandle,
    _port: OwnedHandle,
    tree_empty: oneshot::Receiver<()>,
    drained: bool,
}

impl JobObject {
    /// Create a job and completion port, assign `pid` to the job and start the
    /// monitor thread. The error string becomes the degradation reason.
    pub(crate) fn attach(pid: u32) -> Result<Self, String> {
        let job = unsafe { CreateJobObjectW(None, PCWSTR::null()) }
            .map(OwnedHandle)
            .map_err(|e| format!("CreateJobObjectW failed: {e}"))?;

        let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        }
        .map_err(|e| format!("configuring job limits failed: {e}"))?;

        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, HANDLE::default(), 0, 1) }
            .map(OwnedHandle)
            .map_err(|e| format!("CreateIoCompletionPort failed: {e}"))?;

        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: JOB_COMPLETION_KEY as *mut c_void,
            CompletionPort: port.0,
        };
        unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectAssociateCompletionPortInformation,
                &association as *const _ as *const c_void,
                std::mem::size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
            )
        }
        .map_err(|e| format!("associating completion port failed: {e}"))?;

        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid) }
            .map(OwnedHandle)
            .map_err(|e| format!("OpenProcess({pid}) failed: {e}"))?;
        unsafe { AssignProcessToJobObject(job.0, process.0) }
            .map_err(|e| format!("AssignProcessToJobObject failed: {e}"))?;
        drop(process);

        let (tx, rx) = oneshot::channel();
        let monitored = PortHandle(port.0);
        std::thread::Builder::new()
            .name(format!("job-monitor-{pid}"))
            .spawn(move || monitor(monitored, tx))
            .map_err(|e| format!("starting job monitor failed: {e}"))?;

        info!(pid, "process assigned to job object");
        Ok(Self {
            job,
            _port: port,
            tree_empty: rx,
            drained: false,
        })
    }

    /// Terminate every process in the job.
    pub(crate) fn terminate(&self) -> io::Result<()> {
        unsafe { TerminateJobObject(self.job.0, TERMINATED_EXIT_CODE) }.map_err(io::Error::from)
    }

    /// Wait for the monitor's "tree empty" message. Resolves immediately once
    /// the message (or the monitor's exit) has been observed.
    pub(crate) async fn drained(&mut self) {
        if self.drained {
            return;
        }
        if (&mut self.tree_empty).await.is_err() {
            debug!("job monitor stopped before the job drained; falling back to the root process");
        }
        self.drained = true;
    }
}

fn monitor(port: PortHandle, tree_empty: oneshot::Sender<()>) {
    loop {
        let mut message = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let status = unsafe {
            GetQueuedCompletionStatus(port.0, &mut message, &mut key, &mut overlapped, INFINITE)
        };
        if let Err(e) = status {
            if e.code() == HRESULT::from_win32(ERROR_ABANDONED_WAIT_0) {
                debug!("completion port closed");
            } else {
                warn!(error = %e, "completion port error; job monitor exiting");
            }
            return;
        }
        if key != JOB_COMPLETION_KEY {
            continue;
        }

        // For job notifications the "overlapped" slot carries the pid.
        let pid = overlapped as usize;
        match message {
            MSG_NEW_PROCESS => debug!(pid, "process attached to job"),
            MSG_EXIT_PROCESS => debug!(pid, "job process exited"),
            MSG_ABNORMAL_EXIT_PROCESS => debug!(pid, "job process exited abnormally"),
            MSG_ACTIVE_PROCESS_ZERO => {
                debug!("no active processes left in job");
                let _ = tree_empty.send(());
                return;
            }
            _ => {}
        }
    }
}
