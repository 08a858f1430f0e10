//! Platform shim for process-group spawning and signalling.
//!
//! On POSIX the child is placed in a fresh process group (`setpgid(0, 0)`
//! via `process_group(0)`) so teardown signals reach grandchildren the
//! aggregator spawns. On Windows there is no equivalent group here; only
//! the direct child is killed and grandchildren may survive teardown.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::InstanceError;

/// Signal used for graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGTERM (graceful).
    Term,
    /// SIGKILL (forced).
    Kill,
}

/// Spawns `command` in a new process group with piped stdout/stderr.
///
/// # Errors
///
/// Returns [`InstanceError::SpawnFailed`] if the OS rejects the spawn.
pub fn spawn_in_new_process_group(mut command: Command) -> Result<Child, InstanceError> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(unix)]
    {
        command.process_group(0);
    }

    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    command.spawn().map_err(|e| InstanceError::SpawnFailed {
        binary: program,
        message: e.to_string(),
    })
}

/// Sends `signal` to the process group led by `pid`.
///
/// On Windows this is a no-op; callers fall back to killing the direct
/// child handle.
pub fn signal_process_group(pid: u32, signal: Shutdown) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let sig = match signal {
            Shutdown::Term => Signal::SIGTERM,
            Shutdown::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) => debug!(pid, ?signal, "signalled process group"),
            Err(e) => warn!(pid, ?signal, error = %e, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        warn!(pid, "process groups are not signalled on this platform");
    }
}

/// Terminates a child: SIGTERM to the group, a bounded wait, then SIGKILL.
///
/// Returns once the child has been reaped (or the kill wait elapses).
pub async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    signal_process_group(pid, Shutdown::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, %status, "aggregator exited after SIGTERM");
            return;
        }
        Ok(Err(e)) => warn!(pid, error = %e, "wait failed after SIGTERM"),
        Err(_) => warn!(pid, grace = ?grace, "aggregator ignored SIGTERM"),
    }

    signal_process_group(pid, Shutdown::Kill);
    if let Err(e) = child.kill().await {
        warn!(pid, error = %e, "kill failed");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_pipes_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo spawned"]);
        let mut child = spawn_in_new_process_group(command).unwrap();
        assert!(child.stdout.is_some());
        assert!(child.stderr.is_some());
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn terminate_reaps_a_sleeping_child() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let mut child = spawn_in_new_process_group(command).unwrap();
        terminate(&mut child, Duration::from_secs(2)).await;
        // try_wait returns a status once the child is gone.
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn group_signal_reaches_grandchildren() {
        // The shell spawns a grandchild sleep; killing the group kills both.
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30 & wait"]);
        let mut child = spawn_in_new_process_group(command).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminate(&mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn spawn_failure_is_reported() {
        let command = Command::new("/definitely/not/a/binary");
        let err = spawn_in_new_process_group(command).unwrap_err();
        assert!(matches!(err, InstanceError::SpawnFailed { .. }));
    }
}
