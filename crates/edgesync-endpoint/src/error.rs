//! Runtime errors.

use edgesync_core::ModelError;
use edgesync_proto::MessageError;

/// Errors for message store operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// `SQLite` failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Unknown store type in configuration
    #[error("unknown store type: {0}")]
    UnknownStore(String),
}

/// Errors for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection error: {0}")]
    Connect(String),
    /// Connect did not complete in time
    #[error("connection attempt timed out")]
    Timeout,
    /// No session is established
    #[error("not connected")]
    NotConnected,
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// Errors surfaced by the endpoint API.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Data model error
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Encoding error
    #[error(transparent)]
    Message(#[from] MessageError),
    /// Message store error
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The endpoint was already started
    #[error("endpoint already started")]
    AlreadyStarted,
    /// The endpoint was closed
    #[error("endpoint closed")]
    Closed,
    /// A transaction is already open
    #[error("a transaction is already open")]
    TransactionOpen,
    /// No transaction is open
    #[error("no transaction is open")]
    NoTransaction,
}
