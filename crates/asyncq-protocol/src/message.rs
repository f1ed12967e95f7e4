use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Single-byte tag identifying each frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Declare = 1,
    Consume = 2,
    Publish = 3,
    Ack = 4,
    Nack = 5,
    Revoke = 6,
    KvSet = 7,
    KvGet = 8,
    Deliver = 9,
    Ok = 10,
    Error = 11,
    KvValue = 12,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<FrameType> {
        match value {
            1 => Some(FrameType::Declare),
            2 => Some(FrameType::Consume),
            3 => Some(FrameType::Publish),
            4 => Some(FrameType::Ack),
            5 => Some(FrameType::Nack),
            6 => Some(FrameType::Revoke),
            7 => Some(FrameType::KvSet),
            8 => Some(FrameType::KvGet),
            9 => Some(FrameType::Deliver),
            10 => Some(FrameType::Ok),
            11 => Some(FrameType::Error),
            12 => Some(FrameType::KvValue),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Commands and replies exchanged with the broker.
///
/// Commands that expect a reply (`Declare`, `Consume`, `Publish`,
/// `Revoke`, `KvSet`, `KvGet`) are answered with `Ok`, `Error`, or
/// `KvValue` in submission order. `Ack` and `Nack` are fire-and-forget.
/// `Deliver` and `Revoke` also flow from the broker to consumers, outside
/// the request/reply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Declare(DeclareRequest),
    Consume(ConsumeRequest),
    Publish(PublishRequest),
    Ack(AckRequest),
    Nack(NackRequest),
    Revoke(RevokeRequest),
    KvSet(KvSetRequest),
    KvGet(KvGetRequest),
    Deliver(Delivery),
    Ok(OkResponse),
    Error(ErrorResponse),
    KvValue(KvValueResponse),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Declare(_) => FrameType::Declare,
            Frame::Consume(_) => FrameType::Consume,
            Frame::Publish(_) => FrameType::Publish,
            Frame::Ack(_) => FrameType::Ack,
            Frame::Nack(_) => FrameType::Nack,
            Frame::Revoke(_) => FrameType::Revoke,
            Frame::KvSet(_) => FrameType::KvSet,
            Frame::KvGet(_) => FrameType::KvGet,
            Frame::Deliver(_) => FrameType::Deliver,
            Frame::Ok(_) => FrameType::Ok,
            Frame::Error(_) => FrameType::Error,
            Frame::KvValue(_) => FrameType::KvValue,
        }
    }

    /// Shorthand for the empty success reply.
    pub fn ok() -> Frame {
        Frame::Ok(OkResponse {})
    }

    pub fn error(message: impl Into<String>) -> Frame {
        Frame::Error(ErrorResponse {
            message: message.into(),
        })
    }
}

/// Create a queue if it does not exist. Idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareRequest {
    pub queue: String,
    pub durable: bool,
}

/// Start delivering messages from `queue` on this connection, at most
/// `prefetch` unacknowledged at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub queue: String,
    pub prefetch: u16,
}

/// Enqueue a payload on the queue bound to `routing_key`. With an `eta`
/// the broker holds the message until that time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub routing_key: String,
    pub priority: u8,
    pub eta: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRequest {
    pub delivery_tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackRequest {
    pub delivery_tag: u64,
    pub requeue: bool,
}

/// Broadcast to every consumer connection; consumers drop or cancel the
/// task locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvSetRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvGetRequest {
    pub key: String,
}

/// One message pushed to a consumer. `delivery_tag` is unique per
/// connection and settles the message on ack/nack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub priority: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvValueResponse {
    pub value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_round_trip() {
        for byte in 1..=12u8 {
            let frame_type = FrameType::from_u8(byte).unwrap();
            assert_eq!(frame_type.as_u8(), byte);
        }
    }

    #[test]
    fn test_unknown_frame_type() {
        assert_eq!(FrameType::from_u8(0), None);
        assert_eq!(FrameType::from_u8(13), None);
        assert_eq!(FrameType::from_u8(255), None);
    }

    #[test]
    fn test_frame_type_matches_variant() {
        let frame = Frame::Ack(AckRequest { delivery_tag: 9 });
        assert_eq!(frame.frame_type(), FrameType::Ack);
        assert_eq!(Frame::ok().frame_type(), FrameType::Ok);
        assert_eq!(Frame::error("nope").frame_type(), FrameType::Error);
    }
}
