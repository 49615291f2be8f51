//! Wire message enum and frame parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JoinToken;
use crate::error::ProtocolError;

/// Discriminators with a typed variant. Anything else parses to
/// [`MeshMessage::Unknown`].
pub const KNOWN_TYPES: [&str; 13] = [
    "join",
    "joined",
    "llm_request",
    "llm_response",
    "peers",
    "peer_joined",
    "peer_left",
    "ping",
    "pong",
    "gossip",
    "message",
    "error",
    "leave",
];

/// Maximum nesting of relay envelopes accepted.
pub const MAX_ENVELOPE_DEPTH: usize = 8;

/// Directory entry for a mesh member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A frame on the mesh WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    /// Session opener sent by the client.
    Join {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<JoinToken>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Join accepted.
    Joined {
        #[serde(default)]
        mesh: Value,
    },

    /// Graceful goodbye.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Inference request, correlated by `request_id`.
    LlmRequest {
        request_id: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Inference response.
    LlmResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Full peer directory.
    Peers {
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },

    PeerJoined {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    PeerLeft {
        node_id: String,
    },

    Ping {
        #[serde(default)]
        timestamp: u64,
    },

    Pong {
        #[serde(default)]
        timestamp: u64,
    },

    /// Metadata broadcast (endpoint announcements among others).
    Gossip {
        topic: String,
        #[serde(default)]
        data: Value,
    },

    /// Relay envelope; `payload` is another frame or opaque application data.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: Value,
    },

    Error {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Frame with a discriminator this version does not know.
    #[serde(skip)]
    Unknown { kind: String, raw: Value },
}

/// A frame after relay envelopes have been peeled off.
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    /// Innermost `from` seen while unwrapping.
    pub from: Option<String>,
    pub message: MeshMessage,
}

impl MeshMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value
            .as_object()
            .ok_or(ProtocolError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Self::Unknown { kind, raw: value });
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame {
            kind,
            reason: e.to_string(),
        })
    }

    /// Encode as a JSON text frame. `Unknown` frames re-encode their raw value.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            Self::Unknown { raw, .. } => serde_json::to_string(raw),
            other => serde_json::to_string(other),
        };
        encoded.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Wire discriminator.
    pub fn kind(&self) -> &str {
        match self {
            Self::Join { .. } => "join",
            Self::Joined { .. } => "joined",
            Self::Leave { .. } => "leave",
            Self::LlmRequest { .. } => "llm_request",
            Self::LlmResponse { .. } => "llm_response",
            Self::Peers { .. } => "peers",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Gossip { .. } => "gossip",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Peel relay envelopes.
    ///
    /// A `message` whose payload is a typed frame (an object with a `type`
    /// field, or a string holding one) is replaced by that frame, recursively.
    /// A payload without a discriminator is application data and the envelope
    /// itself is returned.
    pub fn unwrap_relay(self) -> Result<Relayed, ProtocolError> {
        let mut from = None;
        let mut current = self;

        for _ in 0..=MAX_ENVELOPE_DEPTH {
            let (envelope_from, payload) = match current {
                Self::Message { from: f, payload } => (f, payload),
                other => {
                    return Ok(Relayed {
                        from,
                        message: other,
                    })
                }
            };

            let inner = match &payload {
                Value::Object(map) if map.contains_key("type") => Some(payload.clone()),
                Value::String(text) => serde_json::from_str::<Value>(text)
                    .ok()
                    .filter(|v| v.get("type").is_some()),
                _ => None,
            };

            if envelope_from.is_some() {
                from = envelope_from.clone();
            }

            match inner {
                Some(inner) => current = Self::from_value(inner)?,
                None => {
                    return Ok(Relayed {
                        from,
                        message: Self::Message {
                            from: envelope_from,
                            payload,
                        },
                    })
                }
            }
        }

        Err(ProtocolError::MalformedFrame {
            kind: "message".into(),
            reason: format!("relay envelopes nested deeper than {MAX_ENVELOPE_DEPTH}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let join = MeshMessage::Join {
            node_id: "node-1".into(),
            token: None,
            capabilities: vec!["llm".into()],
            name: Some("kitchen".into()),
        };
        let value: Value = serde_json::from_str(&join.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "node_id": "node-1", "capabilities": ["llm"], "name": "kitchen"})
        );
    }

    #[test]
    fn test_unknown_type_is_surfaced() {
        let msg = MeshMessage::parse(r#"{"type":"telemetry","cpu":0.4}"#).unwrap();
        match &msg {
            MeshMessage::Unknown { kind, raw } => {
                assert_eq!(kind, "telemetry");
                assert_eq!(raw["cpu"], json!(0.4));
            }
            other => panic!("expected unknown, got {other:?}"),
        }
        assert_eq!(msg.kind(), "telemetry");
    }

    #[test]
    fn test_malformed_known_type_is_error() {
        let err = MeshMessage::parse(r#"{"type":"llm_response"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame { ref kind, .. } if kind == "llm_response"));
    }

    #[test]
    fn test_non_object_frames() {
        assert!(matches!(
            MeshMessage::parse("[1,2]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            MeshMessage::parse(r#"{"kind":"ping"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            MeshMessage::parse("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_relay_envelope_unwraps_recursively() {
        let frame = json!({
            "type": "message",
            "from": "relay",
            "payload": {
                "type": "message",
                "from": "peer-b",
                "payload": "{\"type\":\"peer_left\",\"node_id\":\"peer-c\"}"
            }
        });
        let relayed = MeshMessage::from_value(frame).unwrap().unwrap_relay().unwrap();
        assert_eq!(relayed.from.as_deref(), Some("peer-b"));
        assert_eq!(
            relayed.message,
            MeshMessage::PeerLeft {
                node_id: "peer-c".into()
            }
        );
    }

    #[test]
    fn test_envelope_with_application_payload_is_kept() {
        let frame = json!({"type": "message", "from": "peer-b", "payload": {"text": "hi"}});
        let relayed = MeshMessage::from_value(frame).unwrap().unwrap_relay().unwrap();
        assert_eq!(relayed.from.as_deref(), Some("peer-b"));
        assert!(matches!(relayed.message, MeshMessage::Message { .. }));
    }

    #[test]
    fn test_envelope_depth_is_bounded() {
        let mut frame = json!({"type": "ping", "timestamp": 1});
        for _ in 0..=MAX_ENVELOPE_DEPTH + 1 {
            frame = json!({"type": "message", "payload": frame});
        }
        let msg = MeshMessage::from_value(frame).unwrap();
        assert!(msg.unwrap_relay().is_err());
    }

    #[test]
    fn test_ping_without_timestamp_defaults() {
        assert_eq!(
            MeshMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            MeshMessage::Ping { timestamp: 0 }
        );
    }
}
