//! Inbound message dispatch.
//!
//! Inbound messages of one session are handled in receipt order by a single
//! task. Jobs are the exception: they run on their own tasks.

use std::sync::Arc;

use tokio::sync::mpsc;

use edgesync_core::{clock, Element};
use edgesync_proto::{ExecRequest, InboundKind, InboundMessage, InboundTopic, SetRequest};

use crate::endpoint::Shared;
use crate::logging::LogLevel;
use crate::persistence::LOG_LEVEL_PROPERTY;
use crate::transport::TransportEvent;

/// Handle events until the session is lost. Returns the reason.
pub(crate) async fn run(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) -> String {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message { topic, payload } => handle(&shared, &topic, &payload),
            TransportEvent::ConnectionLost(reason) => return reason,
        }
    }
    "event stream closed".to_string()
}

fn handle(shared: &Arc<Shared>, topic: &str, payload: &[u8]) {
    let Some(inbound) = shared.topics.parse(topic) else {
        tracing::debug!(topic, "Ignoring message on unexpected topic");
        return;
    };
    let kind = match inbound {
        InboundTopic::Set(_) => InboundKind::Set,
        InboundTopic::Exec => InboundKind::Exec,
        InboundTopic::LogsLevel => InboundKind::LogsLevel,
    };
    let message = match shared.formats.decode(payload, kind) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(topic, error = %e, "Failed to decode inbound message");
            return;
        }
    };

    match (inbound, message) {
        (InboundTopic::Set(path), InboundMessage::Set(request)) => apply_set(shared, &path, request),
        (_, InboundMessage::Exec(request)) => start_job(shared, request),
        (_, InboundMessage::LogsLevel(request)) => change_log_level(shared, &request.level),
        (_, other) => tracing::warn!(topic, message = ?other, "Mismatched inbound message"),
    }
}

fn apply_set(shared: &Shared, path: &str, request: SetRequest) {
    let attribute = match shared.locate(path) {
        Ok(Element::Attribute(attribute)) => attribute,
        Ok(_) => {
            tracing::warn!(path, "Set addressed to a non-attribute element");
            return;
        }
        Err(e) => {
            tracing::warn!(path, error = %e, "Dropping set request");
            return;
        }
    };

    let timestamp = clock::from_seconds(request.timestamp);
    match attribute.set_value_from_cloud(request.value, timestamp, request.correlation_id) {
        Ok(true) => tracing::debug!(path, "Applied set request"),
        Ok(false) => tracing::debug!(path, timestamp, "Ignoring stale set request"),
        Err(e) => tracing::warn!(path, error = %e, "Rejected set request"),
    }
}

fn start_job(shared: &Arc<Shared>, request: ExecRequest) {
    tracing::info!(job = %request.job_uri, correlation_id = %request.correlation_id, "Starting job");
    let output = Arc::clone(shared);
    let job = shared.jobs.spawn(request, output);
    shared.track(job.abort_handle());
}

fn change_log_level(shared: &Shared, name: &str) {
    let level: LogLevel = match name.parse() {
        Ok(level) => level,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring log level request");
            return;
        }
    };
    if let Some(handle) = &shared.log_handle {
        handle.set_level(level);
    }
    if let Err(e) = shared
        .delivery
        .store()
        .set_property(LOG_LEVEL_PROPERTY, level.as_str())
    {
        tracing::warn!(error = %e, "Failed to persist log level");
    }
    tracing::info!(level = %level, "Log level changed");
}
