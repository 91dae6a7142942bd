//! Stream supervisor: owns one relay process per running stream.
//!
//! Each stream id gets a slot guarded by its own async mutex. Every lifecycle
//! transition for that id (`start`, `stop`, `restart`) holds the slot lock for
//! its whole duration, including the grace waits, so transitions on one id are
//! totally ordered while transitions on different ids run concurrently.
//!
//! The status cache carries a per-stream generation that every lifecycle
//! transition bumps. An outside observation only lands if no transition
//! happened since it began, so a slow probe cannot undo a `stop`.
//!
//! All public operations are total: process and store failures are logged and
//! turned into a `false` result or an `Error` status, never propagated.

use crate::probe::{HealthProber, ProbeOutcome};
use crate::process::{ProcessHandle, ShutdownOutcome};
use crate::relay::{build_relay_command, describe_command, RelayParams};
use crate::store::StreamStore;
use crate::streams::{redact_credentials, StatusRecord, Stream, StreamId, StreamStatus};
use cam_gateway_config::RelayConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Lifecycle slot of one stream; `Some` while a relay is believed alive.
type Slot = Arc<Mutex<Option<ProcessHandle>>>;

#[derive(Debug, Default)]
struct StatusCache {
    statuses: HashMap<StreamId, StreamStatus>,
    generations: HashMap<StreamId, u64>,
}

impl StatusCache {
    fn generation(&self, id: StreamId) -> u64 {
        self.generations.get(&id).copied().unwrap_or(0)
    }

    fn bump(&mut self, id: StreamId) {
        *self.generations.entry(id).or_insert(0) += 1;
    }
}

pub struct StreamSupervisor {
    relay: RelayConfig,
    prober: HealthProber,
    store: Arc<StreamStore>,
    slots: Mutex<HashMap<StreamId, Slot>>,
    cache: RwLock<StatusCache>,
}

impl StreamSupervisor {
    pub fn new(relay: RelayConfig, prober: HealthProber, store: Arc<StreamStore>) -> Self {
        Self {
            relay,
            prober,
            store,
            slots: Mutex::new(HashMap::new()),
            cache: RwLock::new(StatusCache::default()),
        }
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.relay
    }

    async fn slot(&self, id: StreamId) -> Slot {
        self.slots
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Lifecycle transition: always wins over pending observations.
    async fn set_status(&self, id: StreamId, status: StreamStatus) {
        let mut cache = self.cache.write().await;
        cache.statuses.insert(id, status);
        cache.bump(id);
    }

    /// Launch the relay for `stream` unless one is already running.
    pub async fn start(&self, stream: &Stream) -> bool {
        let slot = self.slot(stream.id).await;
        let mut entry = slot.lock().await;
        self.start_locked(stream, &mut entry).await
    }

    async fn start_locked(&self, stream: &Stream, entry: &mut Option<ProcessHandle>) -> bool {
        if let Some(handle) = entry.as_mut() {
            if handle.is_alive() {
                warn!(stream_id = stream.id, "Stream is already running");
                return true;
            }
            warn!(
                stream_id = stream.id,
                status = ?handle.exit_status(),
                "Relay exited since it was started, launching a new one"
            );
            *entry = None;
        }

        let Some(port) = stream.relay_port(self.relay.base_port) else {
            error!(
                stream_id = stream.id,
                base_port = self.relay.base_port,
                "No valid relay port for stream"
            );
            self.set_status(stream.id, StreamStatus::Error).await;
            return false;
        };

        let params = RelayParams::new(stream.source_url(), port, self.relay.protocol.clone());
        info!(
            stream_id = stream.id,
            source = %redact_credentials(&params.source_url),
            "Starting stream"
        );
        info!(
            stream_id = stream.id,
            command = %describe_command(&build_relay_command(&self.relay.ffmpeg_path, &params.redacted())),
            "Launching relay"
        );

        let cmd = build_relay_command(&self.relay.ffmpeg_path, &params);
        let mut handle = match ProcessHandle::spawn(cmd) {
            Ok(handle) => handle,
            Err(e) => {
                error!(stream_id = stream.id, error = %e, "Error starting stream");
                self.set_status(stream.id, StreamStatus::Error).await;
                return false;
            }
        };

        if handle.wait_for_exit(self.relay.start_grace()).await {
            let stderr = handle.collect_stderr(self.relay.start_grace()).await;
            error!(
                stream_id = stream.id,
                status = ?handle.exit_status(),
                stderr = %stderr,
                "Failed to start stream"
            );
            self.set_status(stream.id, StreamStatus::Error).await;
            return false;
        }

        handle.forward_stderr(stream.id);
        info!(stream_id = stream.id, pid = ?handle.pid(), port, "Stream started successfully");
        *entry = Some(handle);
        self.set_status(stream.id, StreamStatus::Online).await;
        true
    }

    /// Stop the relay of stream `id`: terminate, wait, kill if needed.
    ///
    /// Stopping a stream that is not running succeeds without signalling anything.
    pub async fn stop(&self, id: StreamId) -> bool {
        let slot = self.slot(id).await;
        let mut entry = slot.lock().await;
        self.stop_locked(id, &mut entry).await
    }

    async fn stop_locked(&self, id: StreamId, entry: &mut Option<ProcessHandle>) -> bool {
        let Some(handle) = entry.as_mut() else {
            warn!(stream_id = id, "Stream is not running");
            return true;
        };

        match handle.shutdown(self.relay.stop_grace()).await {
            Ok(outcome) => {
                if outcome == ShutdownOutcome::Killed {
                    warn!(stream_id = id, "Relay ignored termination and was killed");
                }
                *entry = None;
                self.set_status(id, StreamStatus::Offline).await;
                info!(stream_id = id, "Stream stopped successfully");
                true
            }
            Err(e) => {
                // Entry stays so a later stop can retry the cleanup.
                error!(stream_id = id, error = %e, "Error stopping stream");
                false
            }
        }
    }

    /// Stop, pause, start. Returns the result of the start half.
    pub async fn restart(&self, stream: &Stream) -> bool {
        let slot = self.slot(stream.id).await;
        let mut entry = slot.lock().await;

        if !self.stop_locked(stream.id, &mut entry).await {
            warn!(stream_id = stream.id, "Stop failed during restart, starting anyway");
            // The old handle is dropped (and killed) so the new relay can take the port.
            *entry = None;
        }
        tokio::time::sleep(self.relay.restart_pause()).await;
        self.start_locked(stream, &mut entry).await
    }

    /// Probe the stream's source. Does not touch supervisor state.
    pub async fn check_health(&self, stream: &Stream) -> StreamStatus {
        self.probe(stream).await.status
    }

    /// Probe the stream's source, keeping the failure detail.
    pub async fn probe(&self, stream: &Stream) -> ProbeOutcome {
        self.prober.probe(stream).await
    }

    /// Cached status of stream `id`, `Unknown` if never observed.
    pub async fn get_status(&self, id: StreamId) -> StreamStatus {
        self.cache
            .read()
            .await
            .statuses
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    /// Ticket for an outside observation of stream `id`; take it before probing.
    pub async fn begin_observation(&self, id: StreamId) -> u64 {
        self.cache.read().await.generation(id)
    }

    /// Cache an outside observation of stream `id` taken under ticket `since`.
    ///
    /// Returns false, leaving the cache alone, when a lifecycle transition
    /// happened after the ticket was issued.
    pub async fn record_observation(&self, id: StreamId, status: StreamStatus, since: u64) -> bool {
        let mut cache = self.cache.write().await;
        if cache.generation(id) != since {
            debug!(stream_id = id, observed = %status, "Discarding stale observation");
            return false;
        }
        cache.statuses.insert(id, status);
        true
    }

    /// Persist a status reading for stream `id`.
    ///
    /// Returns the stored record, or `None` when the write failed (logged, and
    /// the store is left as it was).
    pub async fn update_status(
        &self,
        id: StreamId,
        status: StreamStatus,
        error_message: Option<String>,
    ) -> Option<StatusRecord> {
        match self.store.upsert_status(id, status, error_message).await {
            Ok(record) => {
                debug!(stream_id = id, status = %status, "Persisted stream status");
                Some(record)
            }
            Err(e) => {
                error!(stream_id = id, error = %e, "Error updating stream status");
                None
            }
        }
    }

    /// Snapshot of every cached status.
    pub async fn all_statuses(&self) -> BTreeMap<StreamId, StreamStatus> {
        self.cache
            .read()
            .await
            .statuses
            .iter()
            .map(|(id, status)| (*id, *status))
            .collect()
    }

    /// Whether a relay is currently held for stream `id`.
    pub async fn is_active(&self, id: StreamId) -> bool {
        let slot = self.slots.lock().await.get(&id).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Ids with a relay currently held, in ascending order.
    pub async fn active_ids(&self) -> Vec<StreamId> {
        let slots: Vec<(StreamId, Slot)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut active = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                active.push(id);
            }
        }
        active.sort_unstable();
        active
    }

    /// Drop all bookkeeping for a stream that no longer exists.
    ///
    /// Callers stop the stream first; a slot that still holds a relay is kept.
    pub async fn forget(&self, id: StreamId) {
        {
            let mut cache = self.cache.write().await;
            cache.statuses.remove(&id);
            cache.bump(id);
        }

        let mut slots = self.slots.lock().await;
        let idle = slots
            .get(&id)
            .map(|slot| matches!(slot.try_lock(), Ok(entry) if entry.is_none()))
            .unwrap_or(false);
        if idle {
            slots.remove(&id);
        }
    }

    /// Make the held relay of stream `id` refuse termination.
    #[cfg(test)]
    pub(crate) async fn refuse_termination(&self, id: StreamId, refuse: bool) {
        let slot = self.slot(id).await;
        if let Some(handle) = slot.lock().await.as_mut() {
            handle.set_refuse_termination(refuse);
        };
    }

    /// Stop every running relay. Returns how many failed to stop.
    pub async fn shutdown(&self) -> usize {
        let ids = self.active_ids().await;
        let mut failures = 0;

        for id in ids {
            if !self.stop(id).await {
                failures += 1;
            }
        }

        if failures > 0 {
            warn!(failures, "Some relays could not be stopped");
        }
        failures
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{
        crashing_relay, fast_relay_config, launch_count, long_running_relay, make_stream,
        probe_config, write_script,
    };
    use tempfile::TempDir;

    async fn supervisor_with(program: &std::path::Path, data_dir: &std::path::Path) -> StreamSupervisor {
        let store = Arc::new(StreamStore::open(data_dir).await.unwrap());
        StreamSupervisor::new(
            fast_relay_config(program),
            HealthProber::from_config(&probe_config("true", 5)),
            store,
        )
    }

    #[tokio::test]
    async fn test_start_twice_launches_once() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(1);

        assert!(supervisor.start(&stream).await);
        assert!(supervisor.start(&stream).await);

        assert_eq!(launch_count(temp_dir.path()), 1);
        assert_eq!(supervisor.get_status(1).await, StreamStatus::Online);
        assert!(supervisor.is_active(1).await);

        assert!(supervisor.stop(1).await);
    }

    #[tokio::test]
    async fn test_stop_without_entry_is_noop_success() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        assert!(supervisor.stop(9).await);
        assert_eq!(supervisor.get_status(9).await, StreamStatus::Unknown);
        assert!(!supervisor.is_active(9).await);
    }

    #[tokio::test]
    async fn test_stop_marks_offline_and_clears_entry() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(2);

        assert!(supervisor.start(&stream).await);
        assert!(supervisor.stop(2).await);

        assert_eq!(supervisor.get_status(2).await, StreamStatus::Offline);
        assert!(!supervisor.is_active(2).await);
        assert!(supervisor.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_crashing_relay_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let relay = crashing_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        assert!(!supervisor.start(&make_stream(3)).await);
        assert_eq!(supervisor.get_status(3).await, StreamStatus::Error);
        assert!(!supervisor.is_active(3).await);
    }

    #[tokio::test]
    async fn test_crash_with_inherited_stderr_does_not_stall_start() {
        let temp_dir = TempDir::new().unwrap();
        let relay = write_script(
            temp_dir.path(),
            "forking-relay",
            "sleep 5 &\necho 'Connection refused' >&2\nexit 1\n",
        );
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        let started = std::time::Instant::now();
        assert!(!supervisor.start(&make_stream(3)).await);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        assert_eq!(supervisor.get_status(3).await, StreamStatus::Error);

        // The slot lock was released with the failed start.
        let started = std::time::Instant::now();
        assert!(supervisor.stop(3).await);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_missing_relay_binary_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = supervisor_with(
            std::path::Path::new("/nonexistent/ffmpeg"),
            &temp_dir.path().join("data"),
        )
        .await;

        assert!(!supervisor.start(&make_stream(4)).await);
        assert_eq!(supervisor.get_status(4).await, StreamStatus::Error);
    }

    #[tokio::test]
    async fn test_restart_relaunches() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(5);

        assert!(supervisor.start(&stream).await);
        assert!(supervisor.restart(&stream).await);

        assert_eq!(launch_count(temp_dir.path()), 2);
        assert_eq!(supervisor.get_status(5).await, StreamStatus::Online);
        assert_eq!(supervisor.active_ids().await, vec![5]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_entry_for_retry() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(14);

        assert!(supervisor.start(&stream).await);
        supervisor.refuse_termination(14, true).await;

        assert!(!supervisor.stop(14).await);
        assert!(supervisor.is_active(14).await);
        assert_eq!(supervisor.get_status(14).await, StreamStatus::Online);
        assert_eq!(supervisor.shutdown().await, 1);

        supervisor.refuse_termination(14, false).await;
        assert!(supervisor.stop(14).await);
        assert!(!supervisor.is_active(14).await);
        assert_eq!(supervisor.get_status(14).await, StreamStatus::Offline);
    }

    #[tokio::test]
    async fn test_restart_proceeds_when_stop_fails() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(15);

        assert!(supervisor.start(&stream).await);
        supervisor.refuse_termination(15, true).await;

        assert!(supervisor.restart(&stream).await);
        assert_eq!(launch_count(temp_dir.path()), 2);
        assert_eq!(supervisor.active_ids().await, vec![15]);
        assert_eq!(supervisor.get_status(15).await, StreamStatus::Online);

        // The replacement relay is a fresh handle that stops normally.
        assert_eq!(supervisor.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_restart_of_stopped_stream_starts_it() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        assert!(supervisor.restart(&make_stream(6)).await);
        assert_eq!(launch_count(temp_dir.path()), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_on_same_id_launch_once() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = Arc::new(supervisor_with(&relay, &temp_dir.path().join("data")).await);
        let stream = make_stream(7);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let supervisor = supervisor.clone();
            let stream = stream.clone();
            tasks.push(tokio::spawn(async move { supervisor.start(&stream).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(launch_count(temp_dir.path()), 1);
        assert_eq!(supervisor.active_ids().await, vec![7]);

        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_start_stop_converge() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = Arc::new(supervisor_with(&relay, &temp_dir.path().join("data")).await);
        let stream = make_stream(8);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let supervisor = supervisor.clone();
            let stream = stream.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    supervisor.start(&stream).await
                } else {
                    supervisor.stop(stream.id).await
                }
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        // Whatever order won, the cache agrees with the slot.
        let active = supervisor.is_active(8).await;
        let status = supervisor.get_status(8).await;
        if active {
            assert_eq!(status, StreamStatus::Online);
        } else {
            assert_eq!(status, StreamStatus::Offline);
        }

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_different_ids_run_independently() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        let (s10, s11) = (make_stream(10), make_stream(11));
        let (a, b) = tokio::join!(supervisor.start(&s10), supervisor.start(&s11));
        assert!(a && b);
        assert_eq!(supervisor.active_ids().await, vec![10, 11]);

        assert_eq!(supervisor.shutdown().await, 0);
        assert!(supervisor.active_ids().await.is_empty());
        assert_eq!(
            supervisor.all_statuses().await,
            BTreeMap::from([(10, StreamStatus::Offline), (11, StreamStatus::Offline)])
        );
    }

    #[tokio::test]
    async fn test_check_health_leaves_state_alone() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;

        assert_eq!(supervisor.check_health(&make_stream(12)).await, StreamStatus::Online);
        assert_eq!(supervisor.get_status(12).await, StreamStatus::Unknown);
        assert!(supervisor.all_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_observation_older_than_stop_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(16);

        // A probe begins, then the stream is started and stopped under it.
        let ticket = supervisor.begin_observation(16).await;
        assert!(supervisor.start(&stream).await);
        assert!(supervisor.stop(16).await);

        assert!(!supervisor.record_observation(16, StreamStatus::Online, ticket).await);
        assert_eq!(supervisor.get_status(16).await, StreamStatus::Offline);

        let ticket = supervisor.begin_observation(16).await;
        assert!(supervisor.record_observation(16, StreamStatus::Error, ticket).await);
        assert_eq!(supervisor.get_status(16).await, StreamStatus::Error);
    }

    #[tokio::test]
    async fn test_update_status_upserts_record() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let data_dir = temp_dir.path().join("data");
        let supervisor = supervisor_with(&relay, &data_dir).await;

        let first = supervisor
            .update_status(1, StreamStatus::Error, Some("refused".to_string()))
            .await
            .unwrap();
        assert_eq!(first.error_message.as_deref(), Some("refused"));

        let second = supervisor
            .update_status(1, StreamStatus::Online, None)
            .await
            .unwrap();
        assert_eq!(second.status, StreamStatus::Online);
        assert_eq!(second.error_message, None);
    }

    #[tokio::test]
    async fn test_update_status_swallows_store_failure() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let data_dir = temp_dir.path().join("data");
        let supervisor = supervisor_with(&relay, &data_dir).await;

        let status_dir = data_dir.join("status");
        std::fs::remove_dir_all(&status_dir).unwrap();
        std::fs::write(&status_dir, b"blocked").unwrap();

        let record = supervisor
            .update_status(1, StreamStatus::Offline, None)
            .await;
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_forget_drops_cache_of_stopped_stream() {
        let temp_dir = TempDir::new().unwrap();
        let relay = long_running_relay(temp_dir.path());
        let supervisor = supervisor_with(&relay, &temp_dir.path().join("data")).await;
        let stream = make_stream(13);

        assert!(supervisor.start(&stream).await);
        assert!(supervisor.stop(13).await);
        supervisor.forget(13).await;

        assert_eq!(supervisor.get_status(13).await, StreamStatus::Unknown);
        assert!(!supervisor.is_active(13).await);
    }
}
