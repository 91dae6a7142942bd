//! CAM Gateway
//!
//! Supervises one relay process per configured camera stream and exposes
//! each stream as its own ONVIF device.

pub mod api;
pub mod daemon;
pub mod onvif;
pub mod probe;
pub mod process;
pub mod reconciler;
pub mod relay;
pub mod startup;
pub mod store;
pub mod streams;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use cam_gateway_config as config;
pub use cam_gateway_config::Config;
pub use api::{create_router, ApiError, AppState};
pub use daemon::{Daemon, DaemonError};
pub use onvif::{Document, OnvifResponder, ResponderError};
pub use probe::{HealthProber, ProbeOutcome};
pub use process::{ProcessHandle, ShutdownOutcome};
pub use reconciler::refresh;
pub use relay::{build_relay_command, RelayParams};
pub use startup::{check_tool_available, run_startup_checks, StartupError};
pub use store::{StoreError, StreamStore};
pub use streams::{
    derive_port, normalize_source_url, StatusRecord, Stream, StreamCreate, StreamId, StreamStatus,
    StreamStatusResponse, StreamUpdate,
};
pub use supervisor::StreamSupervisor;
