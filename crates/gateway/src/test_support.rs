//! Fixtures shared by the unit tests.

use crate::streams::{Stream, StreamId};
use cam_gateway_config::{ProbeConfig, RelayConfig};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Write an executable `sh` script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A relay stand-in that records each launch in `<dir>/launches` and stays up.
#[cfg(unix)]
pub fn long_running_relay(dir: &Path) -> PathBuf {
    let launches = dir.join("launches");
    write_script(
        dir,
        "relay",
        &format!("echo launched >> '{}'\nexec sleep 30\n", launches.display()),
    )
}

/// A relay stand-in that dies immediately with a message on stderr.
#[cfg(unix)]
pub fn crashing_relay(dir: &Path) -> PathBuf {
    write_script(dir, "crashing-relay", "echo 'Connection refused' >&2\nexit 1\n")
}

/// Number of launches recorded by [`long_running_relay`].
pub fn launch_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("launches"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Relay settings with short waits suitable for tests.
pub fn fast_relay_config(program: &Path) -> RelayConfig {
    RelayConfig {
        ffmpeg_path: program.display().to_string(),
        protocol: "rtsp".to_string(),
        base_port: 8001,
        start_grace_ms: 200,
        stop_grace_ms: 500,
        restart_pause_ms: 50,
    }
}

pub fn probe_config(program: &str, timeout_secs: u64) -> ProbeConfig {
    ProbeConfig {
        ffprobe_path: program.to_string(),
        timeout_secs,
        refresh_interval_secs: 0,
    }
}

pub fn make_stream(id: StreamId) -> Stream {
    Stream {
        id,
        name: format!("Camera {}", id),
        rtsp_url: "cam.local:554/live".to_string(),
        username: None,
        password: None,
        enabled: true,
        onvif_port: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}
