//! Stream records and the rules derived from them.
//!
//! A stream is a registered upstream camera source. This module holds the
//! persisted record types, the status vocabulary shared by the supervisor and
//! the store, and the two derivations every other component relies on: the
//! credential-merged source address and the relay port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity of a stream record.
pub type StreamId = i64;

/// Scheme prefixed to source addresses that do not carry one.
pub const DEFAULT_SCHEME: &str = "rtsp";

/// Reachability of a stream as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Nothing has been observed yet.
    #[default]
    Unknown,
    /// Relay running, or source answered the probe.
    Online,
    /// Relay stopped, or probe exited non-zero.
    Offline,
    /// Relay or probe could not be run.
    Error,
    /// Probe did not finish within its deadline.
    Timeout,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Unknown => write!(f, "unknown"),
            StreamStatus::Online => write!(f, "online"),
            StreamStatus::Offline => write!(f, "offline"),
            StreamStatus::Error => write!(f, "error"),
            StreamStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// A registered stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub name: String,
    /// Upstream address, with or without scheme and embedded credentials.
    pub rtsp_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub enabled: bool,
    /// Explicit relay port; derived from the id when absent.
    pub onvif_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Stream {
    /// Source address with a scheme and, when configured, credentials spliced in.
    pub fn source_url(&self) -> String {
        normalize_source_url(
            &self.rtsp_url,
            self.username.as_deref(),
            self.password.as_deref(),
        )
    }

    /// Port the relay for this stream listens on.
    ///
    /// Returns `None` only when the derived port does not fit in a `u16`.
    pub fn relay_port(&self, base_port: u16) -> Option<u16> {
        match self.onvif_port {
            Some(port) => Some(port),
            None => derive_port(base_port, self.id),
        }
    }
}

/// Payload for registering a stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamCreate {
    pub name: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub onvif_port: Option<u16>,
}

fn default_enabled() -> bool {
    true
}

/// Partial update of a stream; absent fields are left untouched.
///
/// `username`, `password` and `onvif_port` distinguish an absent field
/// (`None`) from an explicit `null` (`Some(None)`), which clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamUpdate {
    pub name: Option<String>,
    pub rtsp_url: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub username: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub password: Option<Option<String>>,
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub onvif_port: Option<Option<u16>>,
}

/// A present field, possibly `null`. Only called when the key exists.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl StreamUpdate {
    /// Apply the provided fields to `stream`.
    pub fn apply_to(&self, stream: &mut Stream) {
        if let Some(name) = &self.name {
            stream.name = name.clone();
        }
        if let Some(url) = &self.rtsp_url {
            stream.rtsp_url = url.clone();
        }
        if let Some(username) = &self.username {
            stream.username = username.clone();
        }
        if let Some(password) = &self.password {
            stream.password = password.clone();
        }
        if let Some(enabled) = self.enabled {
            stream.enabled = enabled;
        }
        if let Some(port) = self.onvif_port {
            stream.onvif_port = port;
        }
    }
}

/// Persisted outcome of the most recent status check, one per stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    pub last_check: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Body of `GET /api/streams/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStatusResponse {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    pub last_check: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Derive the relay port for a stream without an explicit one.
pub fn derive_port(base_port: u16, id: StreamId) -> Option<u16> {
    let port = i64::from(base_port).checked_add(id)?;
    u16::try_from(port).ok().filter(|p| *p != 0)
}

/// Normalize a source address.
///
/// A missing scheme is replaced by [`DEFAULT_SCHEME`]. When both username and
/// password are set (and non-empty) and the address carries no credentials of
/// its own, they are inserted right after the scheme separator.
pub fn normalize_source_url(url: &str, username: Option<&str>, password: Option<&str>) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => (DEFAULT_SCHEME, url),
    };

    match (non_empty(username), non_empty(password)) {
        (Some(user), Some(pass)) if !rest.contains('@') => {
            format!("{}://{}:{}@{}", scheme, user, pass, rest)
        }
        _ => format!("{}://{}", scheme, rest),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Replace the password part of embedded credentials with `***` for logging.
pub fn redact_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}
