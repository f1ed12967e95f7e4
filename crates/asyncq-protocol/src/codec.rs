use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Frame, FrameType};
use crate::{ProtocolError, MAX_FRAME_SIZE};

/// Length-prefixed frame codec.
///
/// Wire layout: `[u32 length (BE)][u8 frame type][bincode payload]`. The
/// length counts the type byte plus the payload, so the minimum valid
/// length is 1.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        if length == 0 {
            // No room for the type byte.
            return Err(ProtocolError::UnknownFrameType(0));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_data = src.split_to(length);
        let type_byte = frame_data[0];
        let payload = &frame_data[1..];

        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        let frame = match frame_type {
            FrameType::Declare => Frame::Declare(bincode::deserialize(payload)?),
            FrameType::Consume => Frame::Consume(bincode::deserialize(payload)?),
            FrameType::Publish => Frame::Publish(bincode::deserialize(payload)?),
            FrameType::Ack => Frame::Ack(bincode::deserialize(payload)?),
            FrameType::Nack => Frame::Nack(bincode::deserialize(payload)?),
            FrameType::Revoke => Frame::Revoke(bincode::deserialize(payload)?),
            FrameType::KvSet => Frame::KvSet(bincode::deserialize(payload)?),
            FrameType::KvGet => Frame::KvGet(bincode::deserialize(payload)?),
            FrameType::Deliver => Frame::Deliver(bincode::deserialize(payload)?),
            FrameType::Ok => Frame::Ok(bincode::deserialize(payload)?),
            FrameType::Error => Frame::Error(bincode::deserialize(payload)?),
            FrameType::KvValue => Frame::KvValue(bincode::deserialize(payload)?),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = match &frame {
            Frame::Declare(request) => bincode::serialize(request)?,
            Frame::Consume(request) => bincode::serialize(request)?,
            Frame::Publish(request) => bincode::serialize(request)?,
            Frame::Ack(request) => bincode::serialize(request)?,
            Frame::Nack(request) => bincode::serialize(request)?,
            Frame::Revoke(request) => bincode::serialize(request)?,
            Frame::KvSet(request) => bincode::serialize(request)?,
            Frame::KvGet(request) => bincode::serialize(request)?,
            Frame::Deliver(delivery) => bincode::serialize(delivery)?,
            Frame::Ok(response) => bincode::serialize(response)?,
            Frame::Error(response) => bincode::serialize(response)?,
            Frame::KvValue(response) => bincode::serialize(response)?,
        };

        let length = payload.len() + 1;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(frame.frame_type().as_u8());
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckRequest, KvValueResponse, PublishRequest};

    fn publish_frame() -> Frame {
        Frame::Publish(PublishRequest {
            routing_key: "celery".to_string(),
            priority: 3,
            eta: None,
            payload: b"{\"headers\":{}}".to_vec(),
        })
    }

    #[test]
    fn test_round_trip() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        codec.encode(publish_frame(), &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();

        assert_eq!(decoded, publish_frame());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        codec.encode(publish_frame(), &mut buffer).unwrap();

        let mut partial = BytesMut::from(&buffer[..buffer.len() - 5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&buffer[buffer.len() - 5..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(publish_frame()));
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();

        codec
            .encode(Frame::Ack(AckRequest { delivery_tag: 1 }), &mut buffer)
            .unwrap();
        codec
            .encode(
                Frame::KvValue(KvValueResponse {
                    value: Some("v".to_string()),
                }),
                &mut buffer,
            )
            .unwrap();

        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Frame::Ack(AckRequest { delivery_tag: 1 }))
        );
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Frame::KvValue(KvValueResponse {
                value: Some("v".to_string())
            }))
        );
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buffer.put_u8(FrameType::Publish.as_u8());

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_type_byte_rejected() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32(1);
        buffer.put_u8(200);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::UnknownFrameType(200))
        ));
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32(0);

        assert!(codec.decode(&mut buffer).is_err());
    }
}
