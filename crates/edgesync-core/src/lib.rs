//! # EdgeSync Core
//!
//! Data model for an endpoint that mirrors its sensors, actuators and
//! configuration to a broker.
//!
//! This crate provides:
//! - The attribute / object / node tree with set-once identity fields
//! - Write constraints governing who may change an attribute and when
//! - Deterministic topic addressing for every tree element, in both directions
//! - The transaction accumulator used to batch attribute changes
//!
//! The crate performs no I/O. Changes on registered nodes are reported to a
//! [`ChangeSink`], which the endpoint runtime implements.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod clock;
pub mod constraint;
pub mod error;
pub mod node;
pub mod object;
pub mod once;
pub mod topic;
pub mod transaction;
pub mod value;

pub use attribute::{Attribute, AttributeListener, ListenerId, Sample};
pub use constraint::Constraint;
pub use error::ModelError;
pub use node::Node;
pub use object::{ChangeOrigin, ChangeSink, ObjectNode};
pub use topic::{Element, TopicAddress};
pub use transaction::Transaction;
pub use value::{AttributeType, ScalarType, Value};
