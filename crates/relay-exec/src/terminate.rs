//! Process-tree termination.
//!
//! Children are spawned through [`prepare`] so that [`ProcessTree`] can take
//! down everything they started, not just the direct child. On unix the child
//! leads its own process group and the group gets `SIGKILL`; on Windows
//! `taskkill /T /F` walks the tree.

use std::io;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Configure `cmd` so the spawned child can later be killed as a tree.
pub fn prepare(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd.kill_on_drop(true);
}

/// A spawned child's process tree, keyed by the leader pid captured at spawn.
///
/// `Child::id` returns `None` once the leader has been reaped, but its
/// descendants may still be running; the captured pid keeps them reachable.
#[derive(Clone, Copy, Debug)]
pub struct ProcessTree {
    leader: Option<u32>,
}

impl ProcessTree {
    /// Capture the tree of a freshly spawned child.
    pub fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    pub fn leader(&self) -> Option<u32> {
        self.leader
    }

    /// Kill `child` and all of its descendants, then reap it. Best effort: a
    /// child that already exited is not an error.
    pub async fn terminate(&self, child: &mut Child) -> io::Result<()> {
        if let Some(pid) = self.leader {
            if let Err(e) = kill_tree(pid).await {
                warn!(pid, error = %e, "tree kill failed, killing direct child");
            } else {
                debug!(pid, "process tree killed");
            }
        }
        // Covers platforms where the tree kill failed and reaps the leader.
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Kill whatever the leader left running after it exited on its own.
    /// Only unix can still address the tree once the leader is gone; a
    /// Windows pid may already belong to another process.
    pub async fn kill_remaining(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.leader {
            if let Err(e) = kill_tree(pid).await {
                debug!(pid, error = %e, "no descendants left to kill");
            }
        }
    }
}

#[cfg(unix)]
async fn kill_tree(pid: u32) -> io::Result<()> {
    let pgid = pid as libc::pid_t;
    // SAFETY: killpg only sends a signal; an invalid group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(windows)]
async fn kill_tree(pid: u32) -> io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
async fn kill_tree(_pid: u32) -> io::Result<()> {
    Ok(())
}
