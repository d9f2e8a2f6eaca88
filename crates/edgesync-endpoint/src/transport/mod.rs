//! Broker transport capability.
//!
//! A transport opens one session at a time. Inbound publishes and the loss of
//! the session are reported on the event channel returned by
//! [`Transport::connect`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;
pub mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

/// Message the broker publishes when the session dies ungracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic of the will
    pub topic: String,
    /// Payload of the will
    pub payload: Vec<u8>,
    /// Whether the broker retains the will
    pub retain: bool,
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier
    pub client_id: String,
    /// Last will registered with the session
    pub last_will: LastWill,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Start without previous session state
    pub clean_session: bool,
    /// Maximum unacknowledged outgoing publishes
    pub max_inflight: u16,
}

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound publish
    Message {
        /// Topic
        topic: String,
        /// Payload
        payload: Vec<u8>,
    },
    /// The session was lost
    ConnectionLost(String),
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session. Resolves once the broker accepted it.
    ///
    /// # Errors
    ///
    /// Returns error if the broker cannot be reached or rejects the session.
    async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Publish with at-least-once delivery. Resolves once the broker
    /// acknowledged the message.
    ///
    /// # Errors
    ///
    /// Returns error if no session is open or the publish fails.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError>;

    /// Subscribe with at-least-once delivery.
    ///
    /// # Errors
    ///
    /// Returns error if no session is open or the subscription fails.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Close the session gracefully, without triggering the last will.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be sent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;
}
