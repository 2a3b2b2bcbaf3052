//! POSIX process-group primitives.
//!
//! The root is started with `process_group(0)`, so its pid is the group id
//! and `killpg` reaches every descendant that did not leave the group.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Send SIGKILL to the whole group. A group that no longer exists is success.
pub(crate) fn kill_group(pgid: Pid) -> Result<(), Errno> {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => {
            debug!(pgid = pgid.as_raw(), "sent SIGKILL to process group");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pgid = pgid.as_raw(), "process group already exited");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// True while at least one live (non-zombie) process remains in the group.
pub(crate) fn group_alive(pgid: Pid) -> bool {
    match killpg(pgid, None) {
        // EPERM: a member exists but belongs to someone else.
        Ok(()) | Err(Errno::EPERM) => has_live_member(pgid),
        Err(_) => false,
    }
}

// Orphaned members are reparented to init; where init does not reap (bare
// containers) they linger as zombies and still answer signal 0.
#[cfg(target_os = "linux")]
fn has_live_member(pgid: Pid) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .any(|pid| {
            matches!(proc_stat(pid), Some((state, pgrp)) if pgrp == pgid.as_raw() && state != 'Z')
        })
}

#[cfg(not(target_os = "linux"))]
fn has_live_member(_pgid: Pid) -> bool {
    true
}

/// `(state, pgrp)` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub(crate) fn proc_stat(pid: i32) -> Option<(char, i32)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}
