use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod signal;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
pub const MAX_CONTROL_JSON_LEN: usize = 256 * 1024;
pub const MAX_SEQUENCE: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Ack = 0x02,
    CallRequest = 0x03,
    CallAccept = 0x04,
    CallReject = 0x05,
    CallEnd = 0x06,
    CallBusy = 0x07,
    CallTimeout = 0x08,
    IceCandidate = 0x09,
    ChatMessage = 0x0a,
    ChatTyping = 0x0b,
    ChatStopTyping = 0x0c,
    MessageRead = 0x0d,
    Error = 0x0e,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::CallRequest),
            0x04 => Some(Self::CallAccept),
            0x05 => Some(Self::CallReject),
            0x06 => Some(Self::CallEnd),
            0x07 => Some(Self::CallBusy),
            0x08 => Some(Self::CallTimeout),
            0x09 => Some(Self::IceCandidate),
            0x0a => Some(Self::ChatMessage),
            0x0b => Some(Self::ChatTyping),
            0x0c => Some(Self::ChatStopTyping),
            0x0d => Some(Self::MessageRead),
            0x0e => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidFrameType,
    InvalidControlJson,
    UnexpectedEof,
    VarintOverflow,
    FrameTooLarge,
    ControlTooLarge,
    SequenceTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InvalidFrameType => "unknown frame type",
            Self::InvalidControlJson => "malformed control payload",
            Self::UnexpectedEof => "truncated frame",
            Self::VarintOverflow => "varint overflow",
            Self::FrameTooLarge => "frame too large",
            Self::ControlTooLarge => "control payload too large",
            Self::SequenceTooLarge => "sequence out of range",
        };
        f.write_str(label)
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlEnvelope {
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub frame_type: FrameType,
    pub payload: ControlEnvelope,
}

impl Frame {
    /// Serializes the frame as `varint(len) | type | varint(seq) |
    /// varint(payload_len) | payload`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let payload =
            serde_json::to_vec(&self.payload).map_err(|_| CodecError::InvalidControlJson)?;
        if payload.len() > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        let mut inner = Vec::with_capacity(payload.len() + 16);
        inner.push(self.frame_type as u8);
        write_varint(self.sequence, &mut inner);
        write_varint(payload.len() as u64, &mut inner);
        inner.extend_from_slice(&payload);
        if inner.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let mut wire = Vec::with_capacity(inner.len() + 4);
        write_varint(inner.len() as u64, &mut wire);
        wire.extend_from_slice(&inner);
        Ok(wire)
    }

    /// Decodes one frame from the front of `buffer`, returning the frame and
    /// the number of bytes consumed. `UnexpectedEof` means more input is
    /// needed, not a protocol violation.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let (inner_len, prefix) = read_varint(buffer)?;
        let inner_len = usize::try_from(inner_len).map_err(|_| CodecError::FrameTooLarge)?;
        if inner_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let total = prefix + inner_len;
        if buffer.len() < total || inner_len == 0 {
            return Err(CodecError::UnexpectedEof);
        }
        let inner = &buffer[prefix..total];
        let frame_type = FrameType::from_u8(inner[0]).ok_or(CodecError::InvalidFrameType)?;
        let mut offset = 1;
        let (sequence, took) = read_varint(&inner[offset..])?;
        offset += took;
        if sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let (payload_len, took) = read_varint(&inner[offset..])?;
        offset += took;
        let payload_len = usize::try_from(payload_len).map_err(|_| CodecError::ControlTooLarge)?;
        if payload_len > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        if inner.len() < offset + payload_len {
            return Err(CodecError::UnexpectedEof);
        }
        let payload = serde_json::from_slice::<ControlEnvelope>(&inner[offset..offset + payload_len])
            .map_err(|_| CodecError::InvalidControlJson)?;
        Ok((
            Frame {
                sequence,
                frame_type,
                payload,
            },
            total,
        ))
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(input: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (taken, byte) in input.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, taken + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_roundtrip_control_frame() {
        let frame = Frame {
            sequence: 34,
            frame_type: FrameType::Hello,
            payload: ControlEnvelope {
                properties: json!({
                    "protocol_version": PROTOCOL_VERSION,
                    "token": "session-token",
                }),
            },
        };
        let encoded = frame.encode().expect("encode");
        let (decoded, consumed) = Frame::decode(&encoded).expect("decode");
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_requires_full_frame() {
        let frame = Frame {
            sequence: 7,
            frame_type: FrameType::ChatMessage,
            payload: ControlEnvelope {
                properties: json!({"to": "bob", "from": "alice", "content": "hi"}),
            },
        };
        let encoded = frame.encode().expect("encode");
        for cut in 0..encoded.len() {
            match Frame::decode(&encoded[..cut]) {
                Err(CodecError::UnexpectedEof) => {}
                other => panic!("expected eof for cut {}, got {:?}", cut, other),
            }
        }
    }

    #[test]
    fn decode_consumes_one_frame_from_stream() {
        let first = Frame {
            sequence: 1,
            frame_type: FrameType::ChatTyping,
            payload: ControlEnvelope {
                properties: json!({"to": "bob", "from": "alice"}),
            },
        };
        let second = Frame {
            sequence: 2,
            frame_type: FrameType::ChatStopTyping,
            payload: ControlEnvelope {
                properties: json!({"to": "bob", "from": "alice"}),
            },
        };
        let mut stream = first.encode().expect("encode first");
        stream.extend_from_slice(&second.encode().expect("encode second"));
        let (decoded_first, consumed) = Frame::decode(&stream).expect("decode first");
        assert_eq!(decoded_first, first);
        let (decoded_second, rest) = Frame::decode(&stream[consumed..]).expect("decode second");
        assert_eq!(decoded_second, second);
        assert_eq!(consumed + rest, stream.len());
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let frame = Frame {
            sequence: 1,
            frame_type: FrameType::Ack,
            payload: ControlEnvelope {
                properties: json!({}),
            },
        };
        let mut encoded = frame.encode().expect("encode");
        // type byte sits right after the length prefix
        encoded[1] = 0x7f;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(CodecError::InvalidFrameType)
        ));
    }

    #[test]
    fn rejects_sequence_above_limit() {
        let frame = Frame {
            sequence: MAX_SEQUENCE + 1,
            frame_type: FrameType::Ack,
            payload: ControlEnvelope {
                properties: json!({}),
            },
        };
        assert!(matches!(frame.encode(), Err(CodecError::SequenceTooLarge)));
    }

    #[test]
    fn varint_roundtrip() {
        let values = [0u64, 1, 127, 128, 16_384, MAX_SEQUENCE];
        for value in values {
            let mut buffer = Vec::new();
            write_varint(value, &mut buffer);
            let (decoded, consumed) = read_varint(&buffer).expect("decode varint");
            assert_eq!(decoded, value);
            assert_eq!(consumed, buffer.len());
        }
    }
}
