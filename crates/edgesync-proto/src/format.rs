//! Message formats.
//!
//! An endpoint is handed the formats it speaks. The first one encodes
//! everything the endpoint publishes; inbound payloads are decoded by whichever
//! format recognises them.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messages::{
    DelayedEntry, DelayedMessage, ExecRequest, LogLevelRequest, MessageError, OutboundMessage,
    SetRequest,
};

/// Kind of inbound payload to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// `@set`
    Set,
    /// `@exec`
    Exec,
    /// `@logsLevel`
    LogsLevel,
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Attribute set request
    Set(SetRequest),
    /// Job execution request
    Exec(ExecRequest),
    /// Log level change request
    LogsLevel(LogLevelRequest),
}

/// Encoding and decoding of wire messages.
pub trait MessageFormat: Send + Sync {
    /// Format name advertised in the birth message.
    fn name(&self) -> &'static str;

    /// Whether `bytes` look like a payload in this format.
    fn accepts(&self, bytes: &[u8]) -> bool;

    /// Encode an outbound message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialize`] if encoding fails.
    fn encode(&self, message: &OutboundMessage) -> Result<Vec<u8>, MessageError>;

    /// Whether a stored payload can be embedded by [`encode_delayed`].
    ///
    /// [`encode_delayed`]: MessageFormat::encode_delayed
    fn embeds(&self, payload: &[u8]) -> bool;

    /// Encode a replay batch, embedding each payload previously produced by
    /// this format. Empty payloads embed as null.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Deserialize`] if a stored payload is not valid
    /// in this format.
    fn encode_delayed(&self, timestamp: f64, entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, MessageError>;

    /// Decode an inbound payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Deserialize`] if the payload is malformed.
    fn decode(&self, bytes: &[u8], kind: InboundKind) -> Result<InboundMessage, MessageError>;
}

/// JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl JsonFormat {
    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(value).map_err(|e| MessageError::Serialize(e.to_string()))
    }
}

impl MessageFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn accepts(&self, bytes: &[u8]) -> bool {
        bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{')
    }

    fn encode(&self, message: &OutboundMessage) -> Result<Vec<u8>, MessageError> {
        Self::to_vec(message)
    }

    fn embeds(&self, payload: &[u8]) -> bool {
        payload.is_empty() || Self::from_slice::<serde_json::Value>(payload).is_ok()
    }

    fn encode_delayed(&self, timestamp: f64, entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, MessageError> {
        let messages = entries
            .iter()
            .map(|(topic, payload)| {
                let data = if payload.is_empty() {
                    serde_json::Value::Null
                } else {
                    Self::from_slice(payload)?
                };
                Ok(DelayedEntry {
                    topic: topic.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>, MessageError>>()?;
        Self::to_vec(&DelayedMessage {
            timestamp,
            messages,
        })
    }

    fn decode(&self, bytes: &[u8], kind: InboundKind) -> Result<InboundMessage, MessageError> {
        Ok(match kind {
            InboundKind::Set => InboundMessage::Set(Self::from_slice(bytes)?),
            InboundKind::Exec => InboundMessage::Exec(Self::from_slice(bytes)?),
            InboundKind::LogsLevel => InboundMessage::LogsLevel(Self::from_slice(bytes)?),
        })
    }
}

/// CBOR encoding with the same structure as [`JsonFormat`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CborFormat;

impl CborFormat {
    fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }
}

impl MessageFormat for CborFormat {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn accepts(&self, bytes: &[u8]) -> bool {
        // Major type 5: map
        bytes.first().is_some_and(|b| *b >> 5 == 5)
    }

    fn encode(&self, message: &OutboundMessage) -> Result<Vec<u8>, MessageError> {
        Self::to_vec(message)
    }

    fn embeds(&self, payload: &[u8]) -> bool {
        payload.is_empty() || Self::from_slice::<ciborium::Value>(payload).is_ok()
    }

    fn encode_delayed(&self, timestamp: f64, entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, MessageError> {
        let messages = entries
            .iter()
            .map(|(topic, payload)| {
                let data = if payload.is_empty() {
                    ciborium::Value::Null
                } else {
                    Self::from_slice(payload)?
                };
                Ok(DelayedEntry {
                    topic: topic.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>, MessageError>>()?;
        Self::to_vec(&DelayedMessage {
            timestamp,
            messages,
        })
    }

    fn decode(&self, bytes: &[u8], kind: InboundKind) -> Result<InboundMessage, MessageError> {
        Ok(match kind {
            InboundKind::Set => InboundMessage::Set(Self::from_slice(bytes)?),
            InboundKind::Exec => InboundMessage::Exec(Self::from_slice(bytes)?),
            InboundKind::LogsLevel => InboundMessage::LogsLevel(Self::from_slice(bytes)?),
        })
    }
}

/// The formats an endpoint speaks, primary first.
#[derive(Clone)]
pub struct Formats {
    primary: Arc<dyn MessageFormat>,
    formats: Vec<Arc<dyn MessageFormat>>,
}

impl Formats {
    /// Create a set with `primary` used for all outbound messages.
    #[must_use]
    pub fn new(primary: Arc<dyn MessageFormat>) -> Self {
        Self {
            formats: vec![Arc::clone(&primary)],
            primary,
        }
    }

    /// Add a format accepted for inbound messages.
    #[must_use]
    pub fn with(mut self, format: Arc<dyn MessageFormat>) -> Self {
        self.formats.push(format);
        self
    }

    /// Look up a built-in format by name (`json` or `cbor`).
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnsupportedFormat`] for any other name.
    pub fn builtin(name: &str) -> Result<Arc<dyn MessageFormat>, MessageError> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(Arc::new(JsonFormat)),
            "cbor" => Ok(Arc::new(CborFormat)),
            other => Err(MessageError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Format used for outbound messages.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn MessageFormat> {
        &self.primary
    }

    /// Names of all formats.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.formats.iter().map(|f| f.name().to_string()).collect()
    }

    /// Decode an inbound payload with the first format that accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnsupportedFormat`] if no format accepts the
    /// payload, otherwise any decoding error.
    pub fn decode(&self, bytes: &[u8], kind: InboundKind) -> Result<InboundMessage, MessageError> {
        let format = self
            .formats
            .iter()
            .find(|f| f.accepts(bytes))
            .ok_or_else(|| MessageError::UnsupportedFormat(format!("{} byte payload", bytes.len())))?;
        format.decode(bytes, kind)
    }
}

impl Default for Formats {
    fn default() -> Self {
        Self::new(Arc::new(JsonFormat)).with(Arc::new(CborFormat))
    }
}

impl std::fmt::Debug for Formats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AttributeMessage, JobOutputMessage};
    use edgesync_core::{Constraint, Value};
    use serde_json::json;

    fn attribute_message() -> OutboundMessage {
        OutboundMessage::Attribute(AttributeMessage {
            kind: "Number".into(),
            constraint: Constraint::Measure,
            timestamp: Some(1.5),
            value: Some(Value::Number(21.5)),
            correlation_id: None,
        })
    }

    #[test]
    fn foreign_payloads_are_not_embeddable() {
        let message = attribute_message();
        let json = JsonFormat.encode(&message).unwrap();
        let cbor = CborFormat.encode(&message).unwrap();

        assert!(JsonFormat.embeds(&json));
        assert!(JsonFormat.embeds(&[]));
        assert!(!JsonFormat.embeds(&cbor));
        assert!(!JsonFormat.embeds(b"{truncated"));
        assert!(CborFormat.embeds(&cbor));
        assert!(!CborFormat.embeds(&cbor[..cbor.len() - 1]));
    }

    #[test]
    fn json_delayed_embeds_payloads() {
        let format = JsonFormat;
        let update = format.encode(&attribute_message()).unwrap();
        let bytes = format
            .encode_delayed(
                10.0,
                &[
                    ("@update/dev1/nodes/n1/attributes/a".into(), update),
                    ("@nodeRemoved/dev1/n2".into(), Vec::new()),
                ],
            )
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["timestamp"], 10.0);
        assert_eq!(json["messages"][0]["data"]["value"], 21.5);
        assert_eq!(json["messages"][1]["data"], json!(null));
        assert_eq!(json["messages"][1]["topic"], "@nodeRemoved/dev1/n2");
    }

    #[test]
    fn cbor_uses_same_structure() {
        let format = CborFormat;
        let bytes = format
            .encode(&OutboundMessage::JobOutput(JobOutputMessage {
                correlation_id: "c".into(),
                data: "line".into(),
            }))
            .unwrap();
        assert!(format.accepts(&bytes));
        let decoded: JobOutputMessage = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(decoded.data, "line");
    }

    #[test]
    fn formats_pick_decoder_by_payload() {
        let formats = Formats::default();
        let json = br#"{"timestamp": 1.0, "value": true}"#;
        let mut cbor = Vec::new();
        ciborium::into_writer(&json!({"level": "DEBUG"}), &mut cbor).unwrap();

        assert!(matches!(
            formats.decode(json, InboundKind::Set).unwrap(),
            InboundMessage::Set(SetRequest {
                value: Value::Boolean(true),
                ..
            })
        ));
        assert_eq!(
            formats.decode(&cbor, InboundKind::LogsLevel).unwrap(),
            InboundMessage::LogsLevel(LogLevelRequest {
                level: "DEBUG".into()
            })
        );
        assert!(matches!(
            formats.decode(b"garbage", InboundKind::Exec),
            Err(MessageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn builtin_lookup() {
        assert_eq!(Formats::builtin("JSON").unwrap().name(), "json");
        assert!(Formats::builtin("xml").is_err());
        assert_eq!(Formats::default().names(), ["json", "cbor"]);
    }
}
