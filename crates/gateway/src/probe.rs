//! Health prober for stream sources.
//!
//! Runs `ffprobe -v quiet -print_format json -show_streams <source>` against
//! the credential-merged source address and classifies the outcome. The probe
//! is bounded by a hard timeout; a probe that overruns is killed and reported
//! as [`StreamStatus::Timeout`].

use crate::streams::{redact_credentials, Stream, StreamStatus};
use cam_gateway_config::ProbeConfig;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one probe: the classified status and, for anything but
/// `Online`, a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: StreamStatus,
    pub detail: Option<String>,
}

impl ProbeOutcome {
    fn online() -> Self {
        Self {
            status: StreamStatus::Online,
            detail: None,
        }
    }

    fn failed(status: StreamStatus, detail: String) -> Self {
        Self {
            status,
            detail: Some(detail),
        }
    }
}

/// Build the probe command for a source address.
pub fn build_probe_command(program: &str, source_url: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(source_url);
    cmd
}

/// Zero exit means the source answered; anything else means it did not.
pub fn classify_exit(status: ExitStatus) -> StreamStatus {
    if status.success() {
        StreamStatus::Online
    } else {
        StreamStatus::Offline
    }
}

/// Invokes the external probe tool with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HealthProber {
    program: String,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &ProbeConfig) -> Self {
        Self::new(cfg.ffprobe_path.clone(), cfg.timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a stream's source. Never fails; every failure maps to a status.
    pub async fn probe(&self, stream: &Stream) -> ProbeOutcome {
        let outcome = self.probe_url(&stream.source_url()).await;
        if outcome.status != StreamStatus::Online {
            debug!(
                stream_id = stream.id,
                status = %outcome.status,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Probe did not report the source online"
            );
        }
        outcome
    }

    /// Probe an already normalized source address.
    pub async fn probe_url(&self, source_url: &str) -> ProbeOutcome {
        let mut cmd = tokio::process::Command::from(build_probe_command(&self.program, source_url));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    program = %self.program,
                    source = %redact_credentials(source_url),
                    error = %e,
                    "Failed to run probe"
                );
                return ProbeOutcome::failed(
                    StreamStatus::Error,
                    format!("failed to run {}: {}", self.program, e),
                );
            }
        };

        // Dropping the child on timeout kills it (kill_on_drop).
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => match classify_exit(output.status) {
                StreamStatus::Online => ProbeOutcome::online(),
                status => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let detail = if stderr.trim().is_empty() {
                        format!("probe exited with {}", output.status)
                    } else {
                        stderr.trim().to_string()
                    };
                    ProbeOutcome::failed(status, detail)
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Probe failed while waiting for output");
                ProbeOutcome::failed(StreamStatus::Error, format!("probe failed: {}", e))
            }
            Err(_) => ProbeOutcome::failed(
                StreamStatus::Timeout,
                format!("probe timed out after {}s", self.timeout.as_secs_f32()),
            ),
        }
    }
}
