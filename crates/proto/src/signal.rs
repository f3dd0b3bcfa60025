use crate::{CodecError, ControlEnvelope};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// First frame on a freshly opened connect channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectHello {
    pub token: String,
    #[serde(default)]
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub to: String,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub offer: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAccept {
    pub call_id: String,
    pub to: String,
    pub from: String,
    pub answer: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReject {
    pub call_id: String,
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnd {
    pub call_id: String,
    pub to: String,
    pub from: String,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_usage: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub to: String,
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSend {
    pub to: String,
    pub from: String,
    pub content: String,
}

/// Shared by the typing and stop-typing events; the frame type tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTyping {
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRead {
    pub message_id: String,
}

fn encode_control<T: Serialize>(value: T) -> Result<ControlEnvelope, CodecError> {
    serde_json::to_value(value)
        .map(|properties| ControlEnvelope { properties })
        .map_err(|_| CodecError::InvalidControlJson)
}

fn decode_control<T: DeserializeOwned>(envelope: &ControlEnvelope) -> Result<T, CodecError> {
    serde_json::from_value(envelope.properties.clone()).map_err(|_| CodecError::InvalidControlJson)
}

macro_rules! impl_control_codec {
    ($ty:ty) => {
        impl TryFrom<$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&ControlEnvelope> for $ty {
            type Error = CodecError;

            fn try_from(envelope: &ControlEnvelope) -> Result<Self, Self::Error> {
                decode_control::<$ty>(envelope)
            }
        }
    };
}

impl_control_codec!(ConnectHello);
impl_control_codec!(CallRequest);
impl_control_codec!(CallAccept);
impl_control_codec!(CallReject);
impl_control_codec!(CallEnd);
impl_control_codec!(IceCandidate);
impl_control_codec!(ChatSend);
impl_control_codec!(ChatTyping);
impl_control_codec!(MessageRead);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlEnvelope;
    use serde_json::json;

    #[test]
    fn call_request_roundtrip() {
        let request = CallRequest {
            to: "bob".to_string(),
            from: "alice".to_string(),
            kind: CallKind::Video,
            offer: json!({"sdp": "v=0", "type": "offer"}),
        };
        let envelope: ControlEnvelope = (&request).try_into().expect("encode");
        assert_eq!(envelope.properties["type"], json!("video"));
        let decoded = CallRequest::try_from(&envelope).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn call_request_rejects_unknown_kind() {
        let envelope = ControlEnvelope {
            properties: json!({
                "to": "bob",
                "from": "alice",
                "type": "hologram",
                "offer": {"sdp": "v=0"},
            }),
        };
        assert!(CallRequest::try_from(&envelope).is_err());
    }

    #[test]
    fn call_request_rejects_missing_offer() {
        let envelope = ControlEnvelope {
            properties: json!({
                "to": "bob",
                "from": "alice",
                "type": "audio",
            }),
        };
        assert!(CallRequest::try_from(&envelope).is_err());
    }

    #[test]
    fn call_end_defaults_optional_fields() {
        let envelope = ControlEnvelope {
            properties: json!({
                "call_id": "call-1",
                "to": "alice",
                "from": "bob",
            }),
        };
        let decoded = CallEnd::try_from(&envelope).expect("decode");
        assert!(decoded.ended_at.is_none());
        assert!(decoded.data_usage.is_none());
    }

    #[test]
    fn call_end_accepts_usage_and_timestamp() {
        let envelope = ControlEnvelope {
            properties: json!({
                "call_id": "call-2",
                "to": "alice",
                "from": "bob",
                "ended_at": "2025-06-01T12:00:00Z",
                "data_usage": 4096,
            }),
        };
        let decoded = CallEnd::try_from(&envelope).expect("decode");
        assert_eq!(decoded.data_usage, Some(4096));
        assert!(decoded.ended_at.is_some());
    }

    #[test]
    fn chat_send_requires_all_fields() {
        let envelope = ControlEnvelope {
            properties: json!({"to": "bob", "content": "hi"}),
        };
        assert!(ChatSend::try_from(&envelope).is_err());
        let envelope = ControlEnvelope {
            properties: json!({"to": "bob", "from": "alice", "content": "hi"}),
        };
        let decoded = ChatSend::try_from(&envelope).expect("decode");
        assert_eq!(decoded.content, "hi");
    }

    #[test]
    fn hello_roundtrip_with_optional_push_token() {
        let bare = ControlEnvelope {
            properties: json!({"token": "secret"}),
        };
        let decoded = ConnectHello::try_from(&bare).expect("decode");
        assert!(decoded.push_token.is_none());

        let full = ConnectHello {
            token: "secret".to_string(),
            push_token: Some("ExponentPushToken[abc]".to_string()),
        };
        let envelope: ControlEnvelope = (&full).try_into().expect("encode");
        let decoded = ConnectHello::try_from(&envelope).expect("decode");
        assert_eq!(decoded, full);
    }

    #[test]
    fn ice_candidate_requires_candidate() {
        let envelope = ControlEnvelope {
            properties: json!({"to": "bob"}),
        };
        assert!(IceCandidate::try_from(&envelope).is_err());
        let envelope = ControlEnvelope {
            properties: json!({"to": "bob", "candidate": {"sdpMid": "0"}}),
        };
        assert!(IceCandidate::try_from(&envelope).is_ok());
    }

    #[test]
    fn message_read_shape() {
        let envelope = ControlEnvelope {
            properties: json!({"message_id": "msg-1"}),
        };
        let decoded = MessageRead::try_from(&envelope).expect("decode");
        assert_eq!(decoded.message_id, "msg-1");
    }
}
