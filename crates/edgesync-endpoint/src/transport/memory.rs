//! In-memory transport for tests and local runs.
//!
//! Records every publish and subscription, and lets the caller inject inbound
//! messages, refuse connects, fail publishes and disconnects, or drop the
//! session.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{ConnectOptions, LastWill, Transport, TransportEvent};
use crate::error::TransportError;

/// A message recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Topic
    pub topic: String,
    /// Payload
    pub payload: Vec<u8>,
    /// Retain flag
    pub retain: bool,
}

#[derive(Default)]
struct State {
    events: Option<mpsc::Sender<TransportEvent>>,
    published: Vec<Published>,
    subscriptions: Vec<String>,
    last_will: Option<LastWill>,
    connect_attempts: usize,
    refuse_connects: usize,
    unreachable: bool,
    fail_publishes: bool,
    fail_disconnects: bool,
}

/// In-memory transport. Clones share the same broker state.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
}

impl MemoryTransport {
    /// Create a reachable transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    /// Make every connect attempt fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Make publishes fail while the session stays up.
    pub fn set_publish_failure(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// Make disconnects report an error; the session is closed regardless.
    pub fn set_disconnect_failure(&self, fail: bool) {
        self.state.lock().fail_disconnects = fail;
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Last will of the most recent session.
    #[must_use]
    pub fn last_will(&self) -> Option<LastWill> {
        self.state.lock().last_will.clone()
    }

    /// Everything published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    /// Messages published on topics starting with `prefix`.
    #[must_use]
    pub fn published_to(&self, prefix: &str) -> Vec<Published> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Subscriptions of all sessions, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Deliver an inbound message to the open session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without a session.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let events = self
            .state
            .lock()
            .events
            .clone()
            .ok_or(TransportError::NotConnected)?;
        events
            .send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Kill the session the way a network failure would: the broker publishes
    /// the last will and the client is told the connection was lost.
    pub async fn drop_connection(&self) {
        let events = {
            let mut state = self.state.lock();
            if let Some(will) = state.last_will.clone() {
                state.published.push(Published {
                    topic: will.topic,
                    payload: will.payload,
                    retain: will.retain,
                });
            }
            state.events.take()
        };
        if let Some(events) = events {
            let _ = events
                .send(TransportEvent::ConnectionLost("connection dropped".into()))
                .await;
        }
        self.changed.notify_waiters();
    }

    /// Wait until at least `count` messages were published on topics starting
    /// with `prefix`, returning them.
    pub async fn wait_for(&self, prefix: &str, count: usize) -> Vec<Published> {
        loop {
            let notified = self.changed.notified();
            let matching = self.published_to(prefix);
            if matching.len() >= count {
                return matching;
            }
            notified.await;
        }
    }

    /// Wait until the session state equals `connected`.
    pub async fn wait_connected(&self, connected: bool) {
        loop {
            let notified = self.changed.notified();
            if self.is_connected() == connected {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let result = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.unreachable {
                Err(TransportError::Connect("broker unreachable".into()))
            } else if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                Err(TransportError::Connect("connection refused".into()))
            } else {
                let (tx, rx) = mpsc::channel(100);
                state.events = Some(tx);
                state.last_will = Some(options.last_will.clone());
                Ok(rx)
            }
        };
        self.changed.notify_waiters();
        result
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.events.is_none() {
                return Err(TransportError::NotConnected);
            }
            if state.fail_publishes {
                return Err(TransportError::Publish("publish rejected".into()));
            }
            state.published.push(Published {
                topic: topic.to_string(),
                payload,
                retain,
            });
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.push(filter.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let fail = {
            let mut state = self.state.lock();
            state.events = None;
            state.fail_disconnects
        };
        self.changed.notify_waiters();
        if fail {
            return Err(TransportError::Connect("disconnect failed".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "test".into(),
            last_will: LastWill {
                topic: "@offline/dev".into(),
                payload: Vec::new(),
                retain: true,
            },
            keep_alive: Duration::from_secs(60),
            clean_session: false,
            max_inflight: 10,
        }
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let transport = MemoryTransport::new();
        transport.refuse_next_connects(1);
        assert!(transport.connect(&options()).await.is_err());
        assert!(transport.connect(&options()).await.is_ok());
        assert_eq!(transport.connect_attempts(), 2);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn dropped_connection_publishes_will() {
        let transport = MemoryTransport::new();
        let mut events = transport.connect(&options()).await.unwrap();
        transport.drop_connection().await;
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConnectionLost("connection dropped".into()))
        );
        assert_eq!(transport.published_to("@offline/dev").len(), 1);
        assert!(transport.publish("x", Vec::new(), false).await.is_err());
    }

    #[tokio::test]
    async fn injected_messages_arrive_in_order() {
        let transport = MemoryTransport::new();
        let mut events = transport.connect(&options()).await.unwrap();
        transport.inject("a", b"1".to_vec()).await.unwrap();
        transport.inject("b", b"2".to_vec()).await.unwrap();
        let topics: Vec<_> = [events.recv().await, events.recv().await]
            .into_iter()
            .filter_map(|e| match e {
                Some(TransportEvent::Message { topic, .. }) => Some(topic),
                _ => None,
            })
            .collect();
        assert_eq!(topics, ["a", "b"]);
    }
}
