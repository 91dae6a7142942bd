//! Resource store persisting stream and status records as JSON files.
//!
//! Layout under the data directory:
//! - `streams/<id>.json` holds one [`Stream`]
//! - `status/<id>.json` holds the [`StatusRecord`] for that stream
//!
//! Every write goes to a `.tmp` sibling first and is renamed over the target.
//! The in-memory view only changes after the rename succeeded, so a failed
//! write leaves both the files and the view as they were.

use crate::streams::{StatusRecord, Stream, StreamCreate, StreamId, StreamStatus, StreamUpdate};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const STREAMS_DIR: &str = "streams";
const STATUS_DIR: &str = "status";

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Stream {0} not found")]
    NotFound(StreamId),

    #[error("ONVIF port {0} is already in use")]
    PortInUse(u16),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct StoreState {
    streams: BTreeMap<StreamId, Stream>,
    statuses: BTreeMap<StreamId, StatusRecord>,
    next_id: StreamId,
}

impl StoreState {
    fn port_taken(&self, port: u16, except: Option<StreamId>) -> bool {
        self.streams
            .values()
            .any(|s| s.onvif_port == Some(port) && Some(s.id) != except)
    }
}

/// Durable stream and status records.
#[derive(Debug)]
pub struct StreamStore {
    root: PathBuf,
    state: RwLock<StoreState>,
}

impl StreamStore {
    /// Open (or create) a store rooted at `root` and load every record.
    ///
    /// Unreadable record files are skipped with a warning.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(STREAMS_DIR)).await?;
        fs::create_dir_all(root.join(STATUS_DIR)).await?;

        let streams: Vec<Stream> = load_records(&root.join(STREAMS_DIR)).await?;
        let statuses: Vec<StatusRecord> = load_records(&root.join(STATUS_DIR)).await?;

        let mut state = StoreState::default();
        for stream in streams {
            state.streams.insert(stream.id, stream);
        }
        for status in statuses {
            state.statuses.insert(status.stream_id, status);
        }
        state.next_id = state.streams.keys().next_back().map_or(1, |id| id + 1);

        debug!(
            root = %root.display(),
            streams = state.streams.len(),
            "Opened stream store"
        );

        Ok(Self {
            root,
            state: RwLock::new(state),
        })
    }

    /// Directory the store writes to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn list(&self) -> Vec<Stream> {
        self.state.read().await.streams.values().cloned().collect()
    }

    pub async fn list_enabled(&self) -> Vec<Stream> {
        self.state
            .read()
            .await
            .streams
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: StreamId) -> Option<Stream> {
        self.state.read().await.streams.get(&id).cloned()
    }

    /// Register a new stream under the next free id.
    pub async fn create(&self, data: StreamCreate) -> Result<Stream, StoreError> {
        let mut state = self.state.write().await;

        if let Some(port) = data.onvif_port {
            if state.port_taken(port, None) {
                return Err(StoreError::PortInUse(port));
            }
        }

        let stream = Stream {
            id: state.next_id,
            name: data.name,
            rtsp_url: data.rtsp_url,
            username: data.username,
            password: data.password,
            enabled: data.enabled,
            onvif_port: data.onvif_port,
            created_at: Utc::now(),
            updated_at: None,
        };

        self.write_record(STREAMS_DIR, stream.id, &stream).await?;
        state.next_id = stream.id + 1;
        state.streams.insert(stream.id, stream.clone());
        Ok(stream)
    }

    /// Apply a partial update to an existing stream.
    pub async fn update(&self, id: StreamId, update: StreamUpdate) -> Result<Stream, StoreError> {
        let mut state = self.state.write().await;

        let current = state.streams.get(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(Some(port)) = update.onvif_port {
            if current.onvif_port != Some(port) && state.port_taken(port, Some(id)) {
                return Err(StoreError::PortInUse(port));
            }
        }

        let mut stream = current.clone();
        update.apply_to(&mut stream);
        stream.updated_at = Some(Utc::now());

        self.write_record(STREAMS_DIR, id, &stream).await?;
        state.streams.insert(id, stream.clone());
        Ok(stream)
    }

    /// Remove a stream together with its status record.
    pub async fn delete(&self, id: StreamId) -> Result<Stream, StoreError> {
        let mut state = self.state.write().await;

        if !state.streams.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        fs::remove_file(self.record_path(STREAMS_DIR, id)).await?;
        let removed = state.streams.remove(&id).ok_or(StoreError::NotFound(id))?;

        if state.statuses.remove(&id).is_some() {
            if let Err(e) = fs::remove_file(self.record_path(STATUS_DIR, id)).await {
                warn!(stream_id = id, error = %e, "Failed to remove status record");
            }
        }

        Ok(removed)
    }

    /// Insert or overwrite the status record of a stream, stamping `last_check`.
    pub async fn upsert_status(
        &self,
        id: StreamId,
        status: StreamStatus,
        error_message: Option<String>,
    ) -> Result<StatusRecord, StoreError> {
        let mut state = self.state.write().await;

        let record = StatusRecord {
            stream_id: id,
            status,
            last_check: Utc::now(),
            error_message,
        };

        self.write_record(STATUS_DIR, id, &record).await?;
        state.statuses.insert(id, record.clone());
        Ok(record)
    }

    pub async fn status(&self, id: StreamId) -> Option<StatusRecord> {
        self.state.read().await.statuses.get(&id).cloned()
    }

    fn record_path(&self, dir: &str, id: StreamId) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", id))
    }

    /// Write `value` to `<dir>/<id>.json` through a temporary file.
    async fn write_record<T: Serialize>(
        &self,
        dir: &str,
        id: StreamId,
        value: &T,
    ) -> Result<(), StoreError> {
        let target = self.record_path(dir, id);
        let mut tmp = target.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let json = serde_json::to_vec_pretty(value)?;

        if let Err(e) = fs::write(&tmp, &json).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Load every `*.json` record in `dir`, skipping the ones that fail to parse.
async fn load_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_record(&path).await {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable record");
            }
        }
    }

    Ok(records)
}

async fn load_record<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}
