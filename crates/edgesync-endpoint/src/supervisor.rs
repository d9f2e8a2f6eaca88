//! Connection supervision.
//!
//! One task per started endpoint drives the session through
//! `Disconnected → Connecting → Online` and back, announcing the endpoint on
//! every successful connect and triggering the backlog replay.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch;
use crate::endpoint::Shared;
use crate::error::{EndpointError, TransportError};

/// Session state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session, and no attempt in progress
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Session established, announced and subscribed
    Online,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Receives session transitions of an endpoint.
pub trait EndpointListener: Send + Sync {
    /// The endpoint is online.
    fn online(&self, _endpoint_id: &str) {}

    /// The endpoint lost its session.
    fn offline(&self, _endpoint_id: &str) {}
}

/// Handle to a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub(crate) fn new(shutdown: Arc<watch::Sender<bool>>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Stop reconnecting. An open session stays up until the endpoint is
    /// closed.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether the supervisor has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the supervisor to stop.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Supervisor task failed");
            }
        }
    }
}

pub(crate) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let options = shared.connect_options();
    let retry = shared.config.retry_interval;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        shared.set_state(SessionState::Connecting);
        tracing::info!(broker = %shared.config.host_uri, transport = shared.transport.name(), "Connecting");

        let attempt = tokio::select! {
            result = tokio::time::timeout(shared.config.connect_timeout, shared.transport.connect(&options)) => {
                result.unwrap_or(Err(TransportError::Timeout))
            }
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok(events) => match go_online(&shared).await {
                Ok(()) => {
                    let mut dispatcher = tokio::spawn(dispatch::run(Arc::clone(&shared), events));
                    tokio::select! {
                        reason = &mut dispatcher => {
                            let reason = reason.unwrap_or_else(|e| e.to_string());
                            tracing::warn!(reason = %reason, "Connection lost");
                            close_session(&shared).await;
                            shared.leave_online();
                        }
                        _ = shutdown.changed() => {
                            dispatcher.abort();
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to announce endpoint");
                    close_session(&shared).await;
                    shared.leave_online();
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Connection attempt failed");
                shared.set_state(SessionState::Disconnected);
            }
        }

        if retry.is_zero() {
            tracing::info!("Reconnect disabled, staying disconnected");
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(retry) => {}
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Supervisor stopped");
}

async fn close_session(shared: &Shared) {
    if let Err(e) = shared.transport.disconnect().await {
        tracing::debug!(error = %e, "Disconnect after session loss failed");
    }
}

/// Announce, subscribe, go online and start the replay, in that order.
async fn go_online(shared: &Arc<Shared>) -> Result<(), EndpointError> {
    let birth = shared.birth_message()?;
    let topic = shared.topics.online();
    tracing::info!(topic = %topic, "Publishing birth message");
    shared.transport.publish(&topic, birth, true).await?;

    for filter in shared.topics.subscriptions() {
        tracing::info!(topic = %filter, "Subscribing");
        shared.transport.subscribe(&filter).await?;
    }

    shared.set_state(SessionState::Online);
    for listener in shared.listeners() {
        listener.online(&shared.id);
    }

    let replaying = Arc::clone(shared);
    let replay = tokio::spawn(async move {
        match replaying.delivery.replay().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "Backlog replayed"),
            Err(e) => tracing::warn!(error = %e, "Replay failed, backlog kept"),
        }
    });
    shared.track(replay.abort_handle());
    Ok(())
}
