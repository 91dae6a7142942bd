//! Startup checks for the gateway
//!
//! Verifies that the relay and probe tools can be executed before any
//! stream is started:
//! - `ffmpeg -version`
//! - `ffprobe -version`

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Extract the version token from `-version` output.
///
/// Handles the usual formats:
/// - Release: "ffmpeg version 6.1.1 Copyright ..."
/// - Git build: "ffprobe version N-113017-g1a2b3c4 ..."
pub fn parse_tool_version(version_output: &str) -> Option<&str> {
    let first_line = version_output.lines().next()?;
    let mut words = first_line.split_whitespace();
    words.find(|w| *w == "version")?;
    words.next()
}

/// Run `<program> -version` and return the reported version.
///
/// Fails when the program cannot be spawned or exits non-zero.
pub fn check_tool_available(program: &str) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version exited with {}", program, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout).unwrap_or("unknown").to_string())
}

/// Run all startup checks
///
/// Checks are run in the following order:
/// 1. Relay tool (`relay.ffmpeg_path`)
/// 2. Probe tool (`probe.ffprobe_path`)
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    for program in [&cfg.relay.ffmpeg_path, &cfg.probe.ffprobe_path] {
        let version = check_tool_available(program)?;
        info!(tool = %program, version = %version, "Found external tool");
    }
    Ok(())
}
