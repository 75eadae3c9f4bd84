//! Batch execution engine
//!
//! Runs command lines to completion under a hard timeout, and maintains the
//! per-machine "previous long-running process" registry used by exclusive
//! execution: before starting an exclusive run, whatever occupant the last
//! job left behind is killed.

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::result::ToolResult;

/// Pid of the long-running process left behind by the previous exclusive
/// run on this machine, if any. At most one exclusive process is alive at a
/// time; the only discipline is "kill the previous occupant".
static LONGRUNNING: Mutex<Option<Pid>> = Mutex::new(None);

/// Run a command line in `work_dir` to completion, capturing combined
/// output and exit status. The timeout is hard: an overrunning process is
/// killed and reported as a non-ok result without an exit status.
pub async fn shell_execution(cmdline: &[String], work_dir: &Path, timeout_secs: u64) -> ToolResult {
    let Some((program, args)) = cmdline.split_first() else {
        return ToolResult::broken("No command line given");
    };

    debug!("Executing {:?} in {:?}", cmdline, work_dir);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
        Ok(Ok(output)) => ToolResult::from_output(&output),
        Ok(Err(e)) => ToolResult::broken(format!("Failed to run '{}': {}", program, e)),
        // Dropping the output future kills the child (kill_on_drop)
        Err(_) => ToolResult::broken(format!(
            "The execution of '{}' was cancelled, since it took longer than {} seconds.",
            program, timeout_secs
        )),
    }
}

/// Remember `pid` as the long-running occupant of this machine
pub fn track_longrunning(pid: u32) {
    let mut slot = LONGRUNNING.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(Pid::from_raw(pid as i32));
}

/// Kill whatever long-running process a previous job left on this machine
pub fn kill_longrunning() {
    let previous = {
        let mut slot = LONGRUNNING.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    };

    let Some(pid) = previous else {
        debug!("No long-running process to kill");
        return;
    };

    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) => info!("Killed long-running process {} from a previous job", pid),
        Err(nix::errno::Errno::ESRCH) => debug!("Long-running process {} already gone", pid),
        Err(e) => warn!("Could not kill long-running process {}: {}", pid, e),
    }
}
