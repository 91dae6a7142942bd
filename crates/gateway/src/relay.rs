//! Relay command construction.
//!
//! The relay copies audio and video from the upstream source to a local
//! listener without re-encoding.

use crate::streams::redact_credentials;
use std::process::Command;

/// Everything needed to launch a relay for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayParams {
    /// Credential-merged source address
    pub source_url: String,
    /// Local port the relay serves on
    pub port: u16,
    /// Output protocol, also used as the output URL scheme
    pub protocol: String,
}

impl RelayParams {
    pub fn new(source_url: String, port: u16, protocol: String) -> Self {
        Self {
            source_url,
            port,
            protocol,
        }
    }

    /// Address the relay publishes to, e.g. `rtsp://0.0.0.0:8002/stream`.
    pub fn output_url(&self) -> String {
        format!("{}://0.0.0.0:{}/stream", self.protocol, self.port)
    }

    /// Copy with the source password masked, for logging.
    pub fn redacted(&self) -> Self {
        Self {
            source_url: redact_credentials(&self.source_url),
            ..self.clone()
        }
    }
}

/// Build the relay command line.
///
/// `<program> -i <source> -c:v copy -c:a copy -f <protocol> <protocol>://0.0.0.0:<port>/stream`
pub fn build_relay_command(program: &str, params: &RelayParams) -> Command {
    let mut cmd = Command::new(program);

    cmd.arg("-i").arg(&params.source_url);
    cmd.arg("-c:v").arg("copy");
    cmd.arg("-c:a").arg("copy");
    cmd.arg("-f").arg(&params.protocol);
    cmd.arg(params.output_url());

    cmd
}

/// Render a command for logging.
pub fn describe_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
