use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use prost::Message;

use crate::types::{
    ConsumerMessageHeader, ErrorMessage, ErrorType, Header, MessageType, Ping, Pong,
    ProducerMessageHeader, SubscribeRequest, Subscription, SubscriptionOp,
};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ping { correlation_id: i32 },
    Pong { correlation_id: i32 },
    Subscribe(Vec<SubscriptionOp>),
    /// Producer publish, as seen by the broker.
    Publish { route: ByteString, payload: Bytes },
    /// Fan-out message, as seen by a consumer.
    Delivery { route: ByteString, correlation_id: i32, payload: Bytes },
    Error { kind: ErrorType, description: String },
}

/// An encoded outbound frame: `[u32 BE length][envelope]` followed by an optional raw payload.
///
/// The length prefix covers the envelope only. The payload is held by reference count,
/// so the same published bytes can back any number of frames.
#[derive(Debug, Clone)]
pub struct Frame {
    head: Bytes,
    payload: Bytes,
}

impl Frame {
    pub fn new<M: Message>(envelope: &M, payload: Bytes) -> Frame {
        let body = envelope.encode_to_vec();
        let mut head = BytesMut::with_capacity(4 + body.len());
        head.put_u32(body.len() as u32);
        head.extend_from_slice(&body);
        Frame { head: head.freeze(), payload }
    }

    #[inline]
    pub fn ping(correlation_id: i32) -> Frame {
        Frame::new(&Ping { header: Header::of(MessageType::Ping), correlation_id }, Bytes::new())
    }

    #[inline]
    pub fn pong(correlation_id: i32) -> Frame {
        Frame::new(&Pong { header: Header::of(MessageType::Pong), correlation_id }, Bytes::new())
    }

    pub fn error<D: Into<String>>(kind: ErrorType, description: D) -> Frame {
        let msg = ErrorMessage {
            header: Header::of(MessageType::Error),
            kind: kind as i32,
            description: description.into(),
        };
        Frame::new(&msg, Bytes::new())
    }

    pub fn subscribe(ops: &[SubscriptionOp]) -> Frame {
        let msg = SubscribeRequest {
            header: Header::of(MessageType::SubscribeRequest),
            subscriptions: ops.iter().map(Subscription::from).collect(),
        };
        Frame::new(&msg, Bytes::new())
    }

    pub fn publish(route: &str, payload: Bytes) -> Frame {
        let msg = ProducerMessageHeader {
            header: Header::of(MessageType::Message),
            route: route.to_owned(),
            message_size: payload.len() as u32,
        };
        Frame::new(&msg, payload)
    }

    /// Fan-out frame built from a prepared header, `payload` is shared, not copied.
    #[inline]
    pub fn delivery(header: &ConsumerMessageHeader, payload: Bytes) -> Frame {
        Frame::new(header, payload)
    }

    /// Size of the envelope, the value carried by the length prefix.
    #[inline]
    pub fn envelope_len(&self) -> usize {
        self.head.len() - 4
    }

    /// Total number of bytes this frame occupies on the wire.
    #[inline]
    pub fn len(&self) -> usize {
        self.head.len() + self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Wire bytes as a chained buffer, suitable for `write_all_buf`.
    #[inline]
    pub fn into_buf(self) -> impl Buf {
        self.head.chain(self.payload)
    }
}
