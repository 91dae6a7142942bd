//! Status reconciliation: fresh probe reading, cached in the supervisor and
//! written through to the store.

use crate::supervisor::StreamSupervisor;
use crate::streams::{Stream, StreamStatusResponse};
use chrono::Utc;
use tracing::debug;

/// Probe `stream`, record the reading and report it.
///
/// The probe detail is persisted with the status record; the returned
/// response carries no error message.
pub async fn refresh(supervisor: &StreamSupervisor, stream: &Stream) -> StreamStatusResponse {
    let cached = supervisor.get_status(stream.id).await;
    let ticket = supervisor.begin_observation(stream.id).await;
    let outcome = supervisor.probe(stream).await;

    if cached != outcome.status {
        debug!(
            stream_id = stream.id,
            cached = %cached,
            observed = %outcome.status,
            "Stream status changed"
        );
    }

    supervisor
        .record_observation(stream.id, outcome.status, ticket)
        .await;
    let last_check = supervisor
        .update_status(stream.id, outcome.status, outcome.detail)
        .await
        .map(|record| record.last_check)
        .unwrap_or_else(Utc::now);

    StreamStatusResponse {
        stream_id: stream.id,
        status: outcome.status,
        last_check,
        error_message: None,
    }
}
