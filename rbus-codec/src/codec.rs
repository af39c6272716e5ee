use std::mem;

use bytes::{Buf, BufMut, BytesMut};
use bytestring::ByteString;
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::packet::{Frame, Packet};
use crate::types::{
    ConsumerMessageHeader, DecodableMessage, ErrorMessage, ErrorType, MessageType, Ping, Pong,
    ProducerMessageHeader, SubscribeRequest, SubscriptionOp,
};

/// Hard ceiling for the length prefix of a single frame, 15 MiB.
pub const MAX_FRAME_SIZE: u32 = 15 * 1024 * 1024;

/// Which end of the connection the codec runs on.
///
/// The `MESSAGE` envelope differs by direction: producers send a
/// `ProducerMessageHeader`, consumers receive a `ConsumerMessageHeader`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecodeState {
    Size,
    Envelope(u32),
    Payload { route: ByteString, correlation_id: i32, size: usize },
}

/// Length-delimited envelope codec.
#[derive(Debug, Clone)]
pub struct BusCodec {
    side: Side,
    state: DecodeState,
    max_frame_size: u32,
    max_payload_size: u32,
}

impl BusCodec {
    pub fn new(side: Side) -> Self {
        BusCodec { side, state: DecodeState::Size, max_frame_size: MAX_FRAME_SIZE, max_payload_size: 0 }
    }

    #[inline]
    pub fn server() -> Self {
        Self::new(Side::Server)
    }

    #[inline]
    pub fn client() -> Self {
        Self::new(Side::Client)
    }

    /// Set max length prefix, clamped to [`MAX_FRAME_SIZE`]. `0` restores the ceiling.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = if size == 0 { MAX_FRAME_SIZE } else { size.min(MAX_FRAME_SIZE) };
        self
    }

    /// Set max raw payload size following a `MESSAGE` envelope. `0` means unlimited.
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    fn decode_envelope(&mut self, buf: bytes::Bytes) -> Result<Option<Packet>, DecodeError> {
        let kind = DecodableMessage::decode(buf.clone())?.kind();
        let packet = match MessageType::try_from(kind) {
            Ok(MessageType::Ping) => {
                Packet::Ping { correlation_id: Ping::decode(buf)?.correlation_id }
            }
            Ok(MessageType::Pong) => {
                Packet::Pong { correlation_id: Pong::decode(buf)?.correlation_id }
            }
            Ok(MessageType::SubscribeRequest) => {
                let req = SubscribeRequest::decode(buf)?;
                Packet::Subscribe(req.subscriptions.into_iter().map(SubscriptionOp::from).collect())
            }
            Ok(MessageType::Message) => {
                let (route, correlation_id, size) = match self.side {
                    Side::Server => {
                        let h = ProducerMessageHeader::decode(buf)?;
                        (h.route, 0, h.message_size)
                    }
                    Side::Client => {
                        let h = ConsumerMessageHeader::decode(buf)?;
                        (h.route, h.correlation_id, h.message_size)
                    }
                };
                if self.max_payload_size != 0 && size > self.max_payload_size {
                    return Err(DecodeError::PayloadTooBig { size, max: self.max_payload_size });
                }
                self.state =
                    DecodeState::Payload { route: ByteString::from(route), correlation_id, size: size as usize };
                return Ok(None);
            }
            Ok(MessageType::Error) => {
                let e = ErrorMessage::decode(buf)?;
                Packet::Error {
                    kind: ErrorType::try_from(e.kind).unwrap_or(ErrorType::Unspecified),
                    description: e.description,
                }
            }
            Ok(MessageType::Unused) | Err(_) => return Err(DecodeError::UnknownType(kind)),
        };
        Ok(Some(packet))
    }
}

impl Default for BusCodec {
    fn default() -> Self {
        Self::server()
    }
}

impl Decoder for BusCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match mem::replace(&mut self.state, DecodeState::Size) {
                DecodeState::Size => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    if size == 0 {
                        src.advance(4);
                        return Err(DecodeError::PayloadTooShort);
                    }
                    if size > self.max_frame_size {
                        return Err(DecodeError::PayloadTooBig { size, max: self.max_frame_size });
                    }
                    src.advance(4);
                    self.state = DecodeState::Envelope(size);
                }
                DecodeState::Envelope(size) => {
                    if src.len() < size as usize {
                        src.reserve(size as usize - src.len());
                        self.state = DecodeState::Envelope(size);
                        return Ok(None);
                    }
                    let buf = src.split_to(size as usize).freeze();
                    if let Some(packet) = self.decode_envelope(buf)? {
                        return Ok(Some(packet));
                    }
                }
                DecodeState::Payload { route, correlation_id, size } => {
                    if src.len() < size {
                        src.reserve(size - src.len());
                        self.state = DecodeState::Payload { route, correlation_id, size };
                        return Ok(None);
                    }
                    let payload = src.split_to(size).freeze();
                    let packet = match self.side {
                        Side::Server => Packet::Publish { route, payload },
                        Side::Client => Packet::Delivery { route, correlation_id, payload },
                    };
                    return Ok(Some(packet));
                }
            }
        }
    }
}

impl Encoder<Frame> for BusCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if item.envelope_len() > self.max_frame_size as usize {
            return Err(EncodeError::FrameTooBig(item.envelope_len()));
        }
        dst.reserve(item.len());
        dst.put(item.into_buf());
        Ok(())
    }
}
