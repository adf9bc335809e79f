//! Wire types exchanged with the transport adapter
//!
//! Inbound messages are validated in stages so that each rejection maps onto
//! exactly one [`MessageError`]: unparseable JSON, then the session namespace,
//! then the worker identity, then the remaining shape.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use super::error::MessageError;

/// Identity of a logical client session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id, rejecting empty identities
    pub fn new(id: impl Into<String>) -> Result<Self, MessageError> {
        let id = id.into();
        if id.is_empty() {
            return Err(MessageError::InvalidIdentity);
        }
        Ok(Self(id))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation requested by an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerOp {
    /// Start (or restart) a worker session
    Spawn,
    /// Deliver input to a running session
    Continue,
}

/// Message payload; every field is optional on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Discard any session and start fresh (spawn only)
    #[serde(default)]
    pub reset: bool,

    /// Session configuration captured on spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,

    /// Persist engine state once this invocation is quiescent
    #[serde(default)]
    pub save: bool,

    /// Input line for the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Forward an escape request to the engine
    #[serde(default)]
    pub interrupt: bool,
}

/// A message received from the remote client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical session identity
    #[serde(rename = "workerID")]
    pub worker_id: WorkerId,

    /// Client-side message counter
    pub counter: u64,

    /// Requested operation
    pub op: WorkerOp,

    /// Operation payload
    #[serde(default)]
    pub payload: Payload,

    /// Session namespace used for routing
    #[serde(rename = "serverID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    /// Opaque client tag echoed back in the batch
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Value>,
}

impl InboundMessage {
    /// Parse and validate a raw message body.
    ///
    /// When `namespace` is set, messages whose `serverID` differs (or is
    /// missing) are rejected as [`MessageError::UnknownNamespace`].
    pub fn parse(body: &str, namespace: Option<&str>) -> Result<Self, MessageError> {
        let raw: Value =
            serde_json::from_str(body).map_err(|e| MessageError::Malformed(e.to_string()))?;
        if !raw.is_object() {
            return Err(MessageError::Malformed("expected a JSON object".to_string()));
        }

        if let Some(expected) = namespace {
            let server_id = raw.get("serverID").and_then(Value::as_str);
            if server_id != Some(expected) {
                return Err(MessageError::UnknownNamespace(server_id.map(str::to_string)));
            }
        }

        match raw.get("workerID").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {}
            _ => return Err(MessageError::InvalidIdentity),
        }

        serde_json::from_value(raw).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Whether this message asks for an unconditional fresh start
    pub fn is_reset(&self) -> bool {
        self.op == WorkerOp::Spawn && self.payload.reset
    }
}

/// One client-visible output item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputEvent {
    /// Console text produced by the engine
    Text {
        /// Text as produced, including newlines
        text: String,
    },
    /// Diagnostic text with a severity level
    Debug {
        /// Diagnostic text
        text: String,
        /// Engine-defined severity
        level: u8,
    },
    /// Structured control notification
    Control {
        /// Notification body; always carries an `id`
        data: Value,
    },
}

impl OutputEvent {
    /// Console text item
    pub fn text(text: impl Into<String>) -> Self {
        OutputEvent::Text { text: text.into() }
    }

    /// Diagnostic item
    pub fn debug(text: impl Into<String>, level: u8) -> Self {
        OutputEvent::Debug {
            text: text.into(),
            level,
        }
    }

    /// The `started` notification sent in response to a spawn
    pub fn started(worker: &WorkerId, counter: u64) -> Self {
        OutputEvent::Control {
            data: json!({
                "id": "started",
                "workerID": worker,
                "counter": counter,
            }),
        }
    }

    /// Control id, if this is a control item
    pub fn control_id(&self) -> Option<&str> {
        match self {
            OutputEvent::Control { data } => data.get("id").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// The single response emitted per invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundBatch {
    /// Session identity the batch belongs to
    #[serde(rename = "workerID")]
    pub worker_id: WorkerId,

    /// Counter of the triggering message
    pub counter: u64,

    /// Output in production order
    pub items: Vec<OutputEvent>,

    /// Echo of the inbound `clientID`
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Value>,

    /// Echo of the inbound `serverID`
    #[serde(rename = "serverID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl OutboundBatch {
    /// Start an empty batch answering `message`
    pub fn answering(message: &InboundMessage) -> Self {
        Self {
            worker_id: message.worker_id.clone(),
            counter: message.counter,
            items: Vec::new(),
            client_id: message.client_id.clone(),
            server_id: message.server_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_continue_message() {
        let body = r#"{"workerID":"W1","counter":2,"op":"continue","payload":{"text":"1+1"}}"#;
        let msg = InboundMessage::parse(body, None).unwrap();

        assert_eq!(msg.worker_id.as_str(), "W1");
        assert_eq!(msg.counter, 2);
        assert_eq!(msg.op, WorkerOp::Continue);
        assert_eq!(msg.payload.text.as_deref(), Some("1+1"));
        assert!(!msg.payload.save);
        assert!(!msg.is_reset());
    }

    #[test]
    fn test_parse_spawn_reset_without_payload_fields() {
        let body = r#"{"workerID":"W1","counter":1,"op":"spawn","payload":{"reset":true}}"#;
        let msg = InboundMessage::parse(body, None).unwrap();
        assert!(msg.is_reset());
        assert!(msg.payload.options.is_none());
    }

    #[test]
    fn test_parse_rejections() {
        assert!(matches!(
            InboundMessage::parse("{not json", None),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse("[1,2]", None),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"workerID":"","counter":1,"op":"spawn"}"#, None),
            Err(MessageError::InvalidIdentity)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"counter":1,"op":"spawn"}"#, None),
            Err(MessageError::InvalidIdentity)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"workerID":"W1","counter":1,"op":"fly"}"#, None),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_namespace_checked_before_identity() {
        let body = r#"{"serverID":"Other","workerID":"","counter":1,"op":"spawn"}"#;
        match InboundMessage::parse(body, Some("Workers")) {
            Err(MessageError::UnknownNamespace(found)) => {
                assert_eq!(found.as_deref(), Some("Other"))
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let body = r#"{"serverID":"Workers","workerID":"W1","counter":1,"op":"spawn"}"#;
        assert!(InboundMessage::parse(body, Some("Workers")).is_ok());
    }

    #[test]
    fn test_batch_wire_shape() {
        let msg = InboundMessage::parse(
            r#"{"workerID":"W1","counter":3,"op":"continue","clientID":"tab-1"}"#,
            None,
        )
        .unwrap();
        let mut batch = OutboundBatch::answering(&msg);
        batch.items.push(OutputEvent::text("2\n"));
        batch.items.push(OutputEvent::debug("careful", 3));

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["workerID"], "W1");
        assert_eq!(value["counter"], 3);
        assert_eq!(value["clientID"], "tab-1");
        assert!(value.get("serverID").is_none());
        assert_eq!(value["items"][0]["kind"], "text");
        assert_eq!(value["items"][0]["text"], "2\n");
        assert_eq!(value["items"][1]["kind"], "debug");
        assert_eq!(value["items"][1]["level"], 3);
    }

    #[test]
    fn test_started_control_item() {
        let worker = WorkerId::new("W1").unwrap();
        let item = OutputEvent::started(&worker, 1);
        assert_eq!(item.control_id(), Some("started"));
        assert_eq!(OutputEvent::text("x").control_id(), None);
    }
}
