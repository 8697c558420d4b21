//! Wire-level message envelope for the CDP connection.
//!
//! A single envelope shape covers all three message kinds exchanged with the
//! browser: command requests (outbound), command replies, and event
//! notifications. Inbound envelopes are disambiguated by field presence:
//! a `method` marks an event, an `id` without a `method` marks a reply.
//! Replies to our own commands never carry a method name, so an envelope
//! with both fields set (only a misbehaving peer produces one) is treated
//! as an event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of one attachment between the connection and a target.
///
/// Assigned by the browser at attach time; a target re-attached later gets a
/// fresh session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable identifier of a logical target (page, frame, worker, browser).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Error object embedded in a command reply by the remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    /// Remote-supplied error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Classification of an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Command reply: `id` present, no `method`.
    Reply,
    /// Event notification: `method` present (with or without `id`).
    Event,
    /// Neither `id` nor `method`: unroutable, dropped with a diagnostic.
    Unknown,
}

/// The generic unit of wire exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id for command requests and replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Session the envelope is scoped to; absent for browser-level traffic.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Method name for command requests and events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters for command requests and events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success payload of a reply (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload of a reply (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Message {
    /// Builds an outbound command request envelope.
    pub fn request(
        id: i64,
        session_id: Option<SessionId>,
        method: &str,
        params: Value,
    ) -> Self {
        Self {
            id: Some(id),
            session_id,
            method: Some(method.to_string()),
            params: if params.is_null() { None } else { Some(params) },
            result: None,
            error: None,
        }
    }

    /// Classifies an inbound envelope by field presence.
    pub fn kind(&self) -> MessageKind {
        if self.method.is_some() {
            MessageKind::Event
        } else if self.id.is_some() {
            MessageKind::Reply
        } else {
            MessageKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_classification() {
        let msg: Message = serde_json::from_value(json!({"id": 7, "result": {"ok": true}})).unwrap();
        assert_eq!(msg.kind(), MessageKind::Reply);
        assert_eq!(msg.id, Some(7));
        assert_eq!(msg.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_event_classification() {
        let msg: Message = serde_json::from_value(json!({
            "method": "Page.loadEventFired",
            "params": {"timestamp": 1.0},
            "sessionId": "S1"
        }))
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Event);
        assert_eq!(msg.session_id, Some(SessionId::from("S1")));
    }

    #[test]
    fn test_both_fields_classified_as_event() {
        // Only a misbehaving peer sends both; replies to our commands never
        // carry a method name.
        let msg: Message =
            serde_json::from_value(json!({"id": 3, "method": "Weird.event"})).unwrap();
        assert_eq!(msg.kind(), MessageKind::Event);
    }

    #[test]
    fn test_neither_field_is_unknown() {
        let msg: Message = serde_json::from_value(json!({"params": {}})).unwrap();
        assert_eq!(msg.kind(), MessageKind::Unknown);
    }

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let req = Message::request(1, None, "Target.getTargets", Value::Null);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"id": 1, "method": "Target.getTargets"}));
    }

    #[test]
    fn test_request_serialization_with_session() {
        let req = Message::request(
            5,
            Some(SessionId::from("S2")),
            "Runtime.evaluate",
            json!({"expression": "1 + 1"}),
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 5);
        assert_eq!(value["sessionId"], "S2");
        assert_eq!(value["method"], "Runtime.evaluate");
        assert_eq!(value["params"]["expression"], "1 + 1");
    }

    #[test]
    fn test_remote_error_deserialization() {
        let msg: Message = serde_json::from_value(json!({
            "id": 9,
            "error": {"code": -32000, "message": "Target closed"}
        }))
        .unwrap();
        let err = msg.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "Target closed");
        assert!(err.data.is_none());
    }
}
