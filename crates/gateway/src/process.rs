//! Owned handle around one spawned relay process.

use chrono::{DateTime, Utc};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::debug;

use crate::streams::StreamId;

/// How a process went away when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own within the grace period.
    Graceful,
    /// Still alive after the grace period and was killed.
    Killed,
}

/// A spawned child together with its start time.
///
/// The child is spawned with `kill_on_drop`, so dropping the handle never
/// leaves the process running.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stderr: Option<ChildStderr>,
    #[cfg(test)]
    refuse_termination: bool,
}

impl ProcessHandle {
    /// Spawn `cmd` with stdin closed, stdout discarded and stderr captured.
    pub fn spawn(cmd: std::process::Command) -> io::Result<Self> {
        let mut cmd = Command::from(cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stderr = child.stderr.take();

        Ok(Self {
            child,
            pid,
            started_at: Utc::now(),
            stderr,
            #[cfg(test)]
            refuse_termination: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the process has not exited yet.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process already exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait up to `grace` for the process to exit. Returns true if it did.
    pub async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => !self.is_alive(),
            Err(_) => false,
        }
    }

    /// Ask the process to exit (SIGTERM on unix).
    pub fn terminate(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if self.refuse_termination {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "termination refused",
            ));
        }

        // id() is None once the child has been reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(io::Error::from(e)),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            self.child.start_kill()
        }
    }

    /// Kill the process and reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    /// Terminate, wait up to `grace`, then kill if still alive.
    pub async fn shutdown(&mut self, grace: Duration) -> io::Result<ShutdownOutcome> {
        self.terminate()?;

        if self.wait_for_exit(grace).await {
            return Ok(ShutdownOutcome::Graceful);
        }

        self.kill().await?;
        Ok(ShutdownOutcome::Killed)
    }

    /// Read whatever the process wrote to stderr, for at most `limit`.
    /// Only meaningful after exit.
    ///
    /// A descendant that inherited the pipe can keep it open past the exit,
    /// so the read gives up at `limit` and returns what arrived so far.
    pub async fn collect_stderr(&mut self, limit: Duration) -> String {
        let Some(mut stderr) = self.stderr.take() else {
            return String::new();
        };

        let mut buf = Vec::new();
        match tokio::time::timeout(limit, stderr.read_to_end(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to read process stderr"),
            Err(_) => debug!(
                limit_ms = limit.as_millis() as u64,
                "Process stderr still open after exit, using partial output"
            ),
        }
        String::from_utf8_lossy(&buf).trim().to_string()
    }

    /// Make every later `terminate` fail, as when the signal is not permitted.
    #[cfg(test)]
    pub(crate) fn set_refuse_termination(&mut self, refuse: bool) {
        self.refuse_termination = refuse;
    }

    /// Drain stderr in the background into debug logs so the pipe never fills.
    pub fn forward_stderr(&mut self, stream_id: StreamId) {
        let Some(stderr) = self.stderr.take() else {
            return;
        };

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stream_id, "relay: {}", line);
            }
        });
    }
}
