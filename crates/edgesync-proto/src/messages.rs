//! Wire messages.
//!
//! Outbound messages are snapshots taken from the tree at encode time.
//! Timestamps travel as fractional seconds since the epoch.

use edgesync_core::{clock, Attribute, Constraint, Node, ObjectNode, Transaction, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Encoded attribute state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMessage {
    /// Declared type name (`Number`, `IntegerArray`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Write constraint
    pub constraint: Constraint,
    /// Time of the last change in seconds, absent for Static attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Current value, absent when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Correlation id of the set request being acknowledged
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl AttributeMessage {
    /// Snapshot an attribute.
    #[must_use]
    pub fn from_attribute(attribute: &Attribute) -> Self {
        let sample = attribute.sample();
        let constraint = attribute.constraint();
        Self {
            kind: attribute.attribute_type().wire_name().to_string(),
            constraint,
            timestamp: sample
                .as_ref()
                .filter(|_| constraint.is_timestamped())
                .map(|s| clock::to_seconds(s.timestamp)),
            value: sample.map(|s| s.value),
            correlation_id: None,
        }
    }

    /// Snapshot an attribute as the acknowledgement of a set request.
    #[must_use]
    pub fn did_set(attribute: &Attribute, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::from_attribute(attribute)
        }
    }
}

/// Encoded object subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMessage {
    /// Conformance class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conforms: Option<String>,
    /// Child objects by name
    #[serde(default)]
    pub objects: IndexMap<String, ObjectMessage>,
    /// Child attributes by name
    #[serde(default)]
    pub attributes: IndexMap<String, AttributeMessage>,
}

impl ObjectMessage {
    /// Snapshot an object and its subtree.
    #[must_use]
    pub fn from_object(object: &ObjectNode) -> Self {
        let (objects, attributes) = children(object);
        Self {
            conforms: object.conformance(),
            objects,
            attributes,
        }
    }
}

/// Encoded node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// Declared interfaces
    #[serde(default)]
    pub implements: Vec<String>,
    /// Child objects by name
    #[serde(default)]
    pub objects: IndexMap<String, ObjectMessage>,
    /// Attributes directly on the node
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, AttributeMessage>,
}

impl NodeMessage {
    /// Snapshot a node and its subtree.
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        let (objects, attributes) = children(node);
        Self {
            implements: node.interfaces(),
            objects,
            attributes,
        }
    }
}

/// Birth announcement describing the whole endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMessage {
    /// Library version
    pub version: String,
    /// Names of formats the endpoint can decode
    pub supported_formats: Vec<String>,
    /// Registered nodes by name
    pub nodes: IndexMap<String, NodeMessage>,
}

impl EndpointMessage {
    /// Snapshot the given nodes.
    #[must_use]
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a Node>, supported_formats: Vec<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_formats,
            nodes: nodes
                .into_iter()
                .map(|node| (node.name(), NodeMessage::from_node(node)))
                .collect(),
        }
    }
}

/// A committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMessage {
    /// Attribute states keyed by address
    pub attributes: IndexMap<String, AttributeMessage>,
}

impl TransactionMessage {
    /// Snapshot every attribute recorded in the transaction.
    #[must_use]
    pub fn from_transaction(transaction: &Transaction) -> Self {
        Self {
            attributes: transaction
                .iter()
                .map(|(address, attribute)| {
                    (
                        address.as_str().to_string(),
                        AttributeMessage::from_attribute(attribute),
                    )
                })
                .collect(),
        }
    }
}

/// A log event shipped to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecordMessage {
    /// Level name (`ERROR`, `WARN`, ...)
    pub level: String,
    /// Event time in seconds
    pub timestamp: f64,
    /// Rendered message
    pub message: String,
    /// Logger (target) name
    pub logger_name: String,
    /// Source location, `file:line` when known
    pub log_source: String,
}

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutputMessage {
    /// Correlation id of the exec request
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// Output line
    pub data: String,
}

/// Any outbound message except the replay batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    /// `@update` / `@didSet`
    Attribute(AttributeMessage),
    /// `@nodeAdded`
    Node(NodeMessage),
    /// `@online`
    Endpoint(EndpointMessage),
    /// `@transaction`
    Transaction(TransactionMessage),
    /// `@logs`
    Log(LogRecordMessage),
    /// `@execOutput`
    JobOutput(JobOutputMessage),
}

/// Replay batch; `data` is each persisted payload embedded as a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedMessage<T> {
    /// Time of the replay in seconds
    pub timestamp: f64,
    /// Replayed messages, oldest first
    pub messages: Vec<DelayedEntry<T>>,
}

/// One replayed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedEntry<T> {
    /// Original topic
    pub topic: String,
    /// Original payload
    pub data: T,
}

/// `@set` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    /// Time of the change in seconds
    pub timestamp: f64,
    /// New value
    pub value: Value,
    /// Correlation id to acknowledge with `@didSet`
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

/// `@exec` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Job to run, `file://name` or `cmd://name`
    #[serde(rename = "jobURI")]
    pub job_uri: String,
    /// Correlation id for output lines
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// Whether output lines are published
    #[serde(rename = "sendOutput", default)]
    pub send_output: bool,
    /// Extra arguments for the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// `@logsLevel` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLevelRequest {
    /// Requested level name
    pub level: String,
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// No configured format understands the payload
    #[error("unsupported message format: {0}")]
    UnsupportedFormat(String),
}

fn children(
    object: &ObjectNode,
) -> (
    IndexMap<String, ObjectMessage>,
    IndexMap<String, AttributeMessage>,
) {
    let objects = object
        .objects()
        .iter()
        .filter_map(|child| Some((child.name()?, ObjectMessage::from_object(child))))
        .collect();
    let attributes = object
        .attributes()
        .iter()
        .filter_map(|attr| Some((attr.name()?, AttributeMessage::from_attribute(attr))))
        .collect();
    (objects, attributes)
}
