//! Protocol-Buffers envelope messages.
//!
//! Every envelope starts with field 1, a [`Header`] carrying the [`MessageType`].
//! Decoding first goes through [`DecodableMessage`] to learn the type, then
//! re-decodes the same bytes as the concrete message.

use bytestring::ByteString;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unused = 0,
    Ping = 1,
    Pong = 2,
    SubscribeRequest = 3,
    Message = 4,
    Error = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionType {
    Unspecified = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    UnsubscribeAll = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorType {
    Unspecified = 0,
    PayloadTooBig = 1,
    PayloadTooShort = 2,
    InvalidMessage = 3,
    UnknownType = 4,
    UnknownOperation = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub kind: i32,
}

impl Header {
    #[inline]
    pub fn of(kind: MessageType) -> Option<Header> {
        Some(Header { kind: kind as i32 })
    }
}

/// Type probe, every envelope decodes as this.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DecodableMessage {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
}

impl DecodableMessage {
    /// Raw type tag, `0` (`UNUSED`) when the header is missing.
    #[inline]
    pub fn kind(&self) -> i32 {
        self.header.as_ref().map(|h| h.kind).unwrap_or_default()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(int32, tag = "2")]
    pub correlation_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Pong {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(int32, tag = "2")]
    pub correlation_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Subscription {
    #[prost(enumeration = "SubscriptionType", tag = "1")]
    pub operation: i32,
    #[prost(string, tag = "2")]
    pub route_prefix: String,
    #[prost(int32, tag = "3")]
    pub correlation_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeRequest {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(message, repeated, tag = "2")]
    pub subscriptions: Vec<Subscription>,
}

/// Sent by producers, followed on the wire by `message_size` raw payload bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProducerMessageHeader {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(string, tag = "2")]
    pub route: String,
    #[prost(uint32, tag = "3")]
    pub message_size: u32,
}

/// Fan-out metadata, followed on the wire by `message_size` raw payload bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConsumerMessageHeader {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(string, tag = "2")]
    pub route: String,
    #[prost(uint32, tag = "3")]
    pub message_size: u32,
    #[prost(int32, tag = "4")]
    pub correlation_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorMessage {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(enumeration = "ErrorType", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub description: String,
}

/// One decoded subscription operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe { route_prefix: ByteString, correlation_id: i32 },
    Unsubscribe { route_prefix: ByteString },
    UnsubscribeAll,
    /// Operation tag this build does not understand, kept so the receiver can reject it.
    Unknown(i32),
}

impl From<Subscription> for SubscriptionOp {
    fn from(s: Subscription) -> Self {
        match SubscriptionType::try_from(s.operation) {
            Ok(SubscriptionType::Subscribe) => SubscriptionOp::Subscribe {
                route_prefix: ByteString::from(s.route_prefix),
                correlation_id: s.correlation_id,
            },
            Ok(SubscriptionType::Unsubscribe) => {
                SubscriptionOp::Unsubscribe { route_prefix: ByteString::from(s.route_prefix) }
            }
            Ok(SubscriptionType::UnsubscribeAll) => SubscriptionOp::UnsubscribeAll,
            Ok(SubscriptionType::Unspecified) | Err(_) => SubscriptionOp::Unknown(s.operation),
        }
    }
}

impl From<&SubscriptionOp> for Subscription {
    fn from(op: &SubscriptionOp) -> Self {
        match op {
            SubscriptionOp::Subscribe { route_prefix, correlation_id } => Subscription {
                operation: SubscriptionType::Subscribe as i32,
                route_prefix: route_prefix.to_string(),
                correlation_id: *correlation_id,
            },
            SubscriptionOp::Unsubscribe { route_prefix } => Subscription {
                operation: SubscriptionType::Unsubscribe as i32,
                route_prefix: route_prefix.to_string(),
                correlation_id: 0,
            },
            SubscriptionOp::UnsubscribeAll => Subscription {
                operation: SubscriptionType::UnsubscribeAll as i32,
                route_prefix: String::new(),
                correlation_id: 0,
            },
            SubscriptionOp::Unknown(operation) => {
                Subscription { operation: *operation, route_prefix: String::new(), correlation_id: 0 }
            }
        }
    }
}
