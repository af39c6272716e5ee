use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::FramedRead;

use rbus_codec::{BusCodec, Frame, Packet};

use crate::error::BusError;
use crate::{Builder, Result};

/// Any byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An accepted, not yet split connection.
pub struct BusStream {
    io: Box<dyn AsyncStream>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl BusStream {
    pub fn new<Io: AsyncStream>(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        BusStream { io: Box::new(io), remote_addr, cfg }
    }

    /// Splits into the single inbound reader and the single outbound writer.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (r, w) = tokio::io::split(self.io);
        let codec = BusCodec::server()
            .max_frame_size(self.cfg.max_frame_size)
            .max_payload_size(self.cfg.max_payload_size);
        (
            FrameReader { io: FramedRead::new(r, codec) },
            FrameWriter { io: w, send_timeout: self.cfg.send_timeout },
        )
    }
}

pub struct FrameReader {
    io: FramedRead<ReadHalf<Box<dyn AsyncStream>>, BusCodec>,
}

impl FrameReader {
    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
        use futures::StreamExt;
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(p))) => Ok(Some(p)),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(None),
            Err(_) => Err(BusError::ReadTimeout.into()),
        }
    }
}

impl futures::Stream for FrameReader {
    type Item = std::result::Result<Packet, BusError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok(packet)) => Some(Ok(packet)),
            Some(Err(e)) => Some(Err(BusError::Decode(e))),
            None => None,
        })
    }
}

pub struct FrameWriter {
    io: WriteHalf<Box<dyn AsyncStream>>,
    send_timeout: Duration,
}

impl FrameWriter {
    /// Writes one frame. The payload is written straight from its shared buffer.
    #[inline]
    pub async fn send(&mut self, frame: Frame) -> std::result::Result<(), BusError> {
        let mut buf = frame.into_buf();
        if self.send_timeout.is_zero() {
            self.io.write_all_buf(&mut buf).await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, self.io.write_all_buf(&mut buf)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BusError::Io(e)),
                Err(_) => Err(BusError::WriteTimeout),
            }
        }
    }

    #[inline]
    pub async fn close(&mut self) -> std::result::Result<(), BusError> {
        if self.send_timeout.is_zero() {
            self.io.shutdown().await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, self.io.shutdown()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BusError::Io(e)),
                Err(_) => Err(BusError::CloseTimeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Encoder;

    #[tokio::test]
    async fn test_split_read_write() {
        let (server, mut client) = tokio::io::duplex(1024);
        let stream = BusStream::new(server, "127.0.0.1:1000".parse().unwrap(), Arc::new(Builder::new()));
        let (mut reader, mut writer) = stream.split();

        let mut wire = BytesMut::new();
        BusCodec::client().encode(Frame::ping(3), &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), Packet::Ping { correlation_id: 3 });

        writer.send(Frame::publish("a", Bytes::from_static(b"xyz"))).await.unwrap();
        writer.close().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[out.len() - 3..], b"xyz");

        drop(client);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (server, _client) = tokio::io::duplex(64);
        let stream = BusStream::new(server, "127.0.0.1:1000".parse().unwrap(), Arc::new(Builder::new()));
        let (mut reader, _writer) = stream.split();
        let err = reader.recv(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BusError>(), Some(BusError::ReadTimeout)));
    }
}
