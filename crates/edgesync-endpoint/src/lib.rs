//! # EdgeSync Endpoint
//!
//! Runtime that keeps an attribute tree in sync with a publish/subscribe
//! broker over an unreliable connection.
//!
//! ## Architecture
//!
//! An [`Endpoint`] runs three kinds of tasks once started:
//! 1. **Supervisor**: connects, announces the tree, subscribes and reconnects
//!    after a loss
//! 2. **Publisher**: sends encoded messages while online and hands failures
//!    back to the store
//! 3. **Dispatcher**: applies inbound set requests in receipt order and starts
//!    jobs
//!
//! Messages that cannot be sent are kept in a bounded queue per category and
//! replayed as one `@delayed` batch when the session comes back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod delivery;
mod dispatch;
pub mod endpoint;
pub mod error;
mod jobs;
pub mod logging;
pub mod persistence;
pub mod supervisor;
pub mod transport;

pub use config::{CategoryLimits, EndpointConfig, PersistenceConfig};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{EndpointError, PersistenceError, TransportError};
pub use logging::{CloudLogHandle, CloudLogLayer, LogLevel, LogSink};
pub use persistence::{Category, MemoryStore, MessageStore, NullStore, PersistedMessage, SqliteStore};
pub use supervisor::{EndpointListener, SessionState, SupervisorHandle};
pub use transport::{MemoryTransport, MqttTransport, Transport};
