#![deny(unsafe_code)]

//! Wire format of the rbus broker.
//!
//! Every frame is `[u32 big-endian length][length bytes of envelope]`. The envelope is a
//! Protocol-Buffers message whose first field is a header carrying the message type
//! (`PING`, `PONG`, `SUBSCRIBE_REQUEST`, `MESSAGE`, `ERROR`). A `MESSAGE` envelope is
//! followed by `message_size` raw payload bytes that are not part of the length prefix.
//!
//! - [`BusCodec`]: `tokio_util::codec` decoder producing [`Packet`]s and encoder for [`Frame`]s
//! - [`types`]: the envelope messages
//! - [`error`]: `DecodeError`/`EncodeError`, with the mapping to the wire error kinds
//!
//! ```
//! use bytes::{Bytes, BytesMut};
//! use rbus_codec::{BusCodec, Frame, Packet};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut buf = BytesMut::new();
//! BusCodec::client().encode(Frame::publish("orders.eu", Bytes::from_static(b"hi")), &mut buf).unwrap();
//! let packet = BusCodec::server().decode(&mut buf).unwrap();
//! assert!(matches!(packet, Some(Packet::Publish { .. })));
//! ```

/// Error types for encoding/decoding operations
pub mod error;

/// Envelope messages
pub mod types;

mod codec;
mod packet;

pub use codec::{BusCodec, Side, MAX_FRAME_SIZE};
pub use packet::{Frame, Packet};
