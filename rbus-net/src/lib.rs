#![deny(unsafe_code)]

//! Listener and stream plumbing for the rbus broker.
//!
//! [`Builder`] configures and binds a TCP listener, [`Listener::accept`] yields an
//! [`Acceptor`] which becomes a [`BusStream`]. A stream is split into exactly one
//! [`FrameReader`] and one [`FrameWriter`], so reads on a connection never overlap
//! and writes are serialized by whoever owns the writer.

mod builder;
mod error;
mod stream;

pub use builder::{Acceptor, Builder, Listener};
pub use error::BusError;
pub use stream::{AsyncStream, BusStream, FrameReader, FrameWriter};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
