//! # EdgeSync Protocol
//!
//! Wire topics, message shapes and encodings.
//!
//! ## Topics
//!
//! Outbound: `@online`, `@offline`, `@nodeAdded`, `@nodeRemoved`, `@update`,
//! `@didSet`, `@transaction`, `@delayed`, `@logs`, `@execOutput`.
//! Inbound: `@set`, `@exec`, `@logsLevel`.
//!
//! ## Formats
//!
//! - `json`: JSON objects, timestamps as fractional seconds
//! - `cbor`: the same structures encoded as CBOR

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod messages;
pub mod topics;

pub use format::{CborFormat, Formats, InboundKind, InboundMessage, JsonFormat, MessageFormat};
pub use messages::{
    AttributeMessage, EndpointMessage, ExecRequest, JobOutputMessage, LogLevelRequest,
    LogRecordMessage, MessageError, NodeMessage, ObjectMessage, OutboundMessage, SetRequest,
    TransactionMessage,
};
pub use topics::{InboundTopic, TopicScheme};
