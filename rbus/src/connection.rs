//! Per-connection state machine.
//!
//! Each accepted stream is split into a reader, driven by [`Connection::run`], and a writer
//! owned by a dedicated task fed through a bounded queue. Everything that wants to write to
//! the connection (pong replies, fan-out from other connections, error frames) goes through
//! [`Peer`], so frames are never interleaved on the wire and a publisher never waits for a
//! slow subscriber.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use rbus_codec::types::SubscriptionOp;
use rbus_codec::{Frame, Packet};
use rbus_net::{BusError, BusStream, FrameReader, FrameWriter};

use crate::broker::Manager;
use crate::subscription::NodeHandle;
use crate::types::{ConnectionId, HashSet};

/// Sending side of a connection's outbound queue.
#[derive(Clone)]
pub struct Peer {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl Peer {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self { id, tx }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueues a frame without waiting, fails when the queue is full or the writer is gone.
    #[inline]
    pub fn deliver(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.tx.try_send(frame)
    }

    #[inline]
    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        self.tx.send(frame).await.map_err(|_| BusError::ConnectionClosed)
    }

    #[cfg(test)]
    pub(crate) fn test_pair(cap: usize) -> (Peer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(cap);
        (Peer::new(ConnectionId::next(), tx), rx)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.id)
    }
}

pub struct Connection {
    peer: Peer,
    remote_addr: SocketAddr,
    listener: String,
    active: Mutex<HashSet<NodeHandle>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    manager: Arc<dyn Manager>,
}

impl Connection {
    /// Splits the stream and starts the writer task.
    ///
    /// The reader is handed back so the caller can register the connection before
    /// the first packet is read.
    pub(crate) fn new(
        stream: BusStream,
        manager: Arc<dyn Manager>,
        cancel: CancellationToken,
    ) -> (Arc<Connection>, FrameReader) {
        let id = ConnectionId::next();
        let remote_addr = stream.remote_addr;
        let listener = stream.cfg.name.clone();
        let (tx, rx) = mpsc::channel(stream.cfg.max_mqueue_len.max(1));
        let (reader, writer) = stream.split();

        tokio::spawn(write_loop(id, remote_addr, writer, rx, cancel.clone()));

        let conn = Arc::new(Connection {
            peer: Peer::new(id, tx),
            remote_addr,
            listener,
            active: Mutex::new(HashSet::default()),
            closed: AtomicBool::new(false),
            cancel,
            manager,
        });
        (conn, reader)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.peer.id
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Name of the listener that accepted this connection.
    #[inline]
    pub fn listener(&self) -> &str {
        &self.listener
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of route-prefixes this connection is currently attached to.
    #[inline]
    pub fn subscriptions(&self) -> usize {
        self.active.lock().len()
    }

    /// Asks the read loop to terminate. Queued frames are still flushed.
    #[inline]
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn run(self: Arc<Self>, mut reader: FrameReader) {
        log::debug!("{} {} start read loop", self.remote_addr, self.id());
        let reason = loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                packet = reader.next() => packet,
            };
            match packet {
                Some(Ok(packet)) => {
                    if let Err(e) = self.handle(packet).await {
                        break Some(e);
                    }
                }
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };

        match reason {
            Some(e) => match e.error_kind() {
                Some(kind) => {
                    log::info!("{} {} protocol error, {}", self.remote_addr, self.id(), e);
                    if let Err(e) = self.peer.send(Frame::error(kind, e.description())).await {
                        log::debug!("{} {} error frame not sent, {}", self.remote_addr, self.id(), e);
                    }
                }
                None => log::debug!("{} {} closed, {}", self.remote_addr, self.id(), e),
            },
            None => log::debug!("{} {} closed", self.remote_addr, self.id()),
        }
        self.killme();
    }

    async fn handle(&self, packet: Packet) -> Result<(), BusError> {
        log::trace!("{} {} packet: {:?}", self.remote_addr, self.id(), packet);
        match packet {
            Packet::Ping { correlation_id } => self.peer.send(Frame::pong(correlation_id)).await?,
            Packet::Pong { correlation_id } => {
                log::trace!("{} {} pong {}", self.remote_addr, self.id(), correlation_id)
            }
            Packet::Subscribe(ops) => self.subscribe(ops)?,
            Packet::Publish { route, payload } => self.manager.publish(route, payload),
            Packet::Delivery { route, .. } => {
                log::warn!("{} {} unexpected delivery on {:?}", self.remote_addr, self.id(), route)
            }
            Packet::Error { kind, description } => {
                log::warn!("{} {} peer reported {:?}: {}", self.remote_addr, self.id(), kind, description)
            }
        }
        Ok(())
    }

    fn subscribe(&self, ops: Vec<SubscriptionOp>) -> Result<(), BusError> {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for op in ops {
            match op {
                SubscriptionOp::Subscribe { route_prefix, correlation_id } => {
                    adds.push((route_prefix, correlation_id))
                }
                SubscriptionOp::Unsubscribe { route_prefix } => removes.push(route_prefix),
                SubscriptionOp::UnsubscribeAll => self.detach_all(),
                SubscriptionOp::Unknown(op) => return Err(BusError::UnknownOperation(op)),
            }
        }

        let added = if adds.is_empty() { Vec::new() } else { self.manager.subscribe(adds, &self.peer) };
        let removed = if removes.is_empty() { Vec::new() } else { self.manager.unsubscribe(removes, self.id()) };

        let mut active = self.active.lock();
        for node in removed {
            // a prefix both added and removed in one request stays subscribed
            if !added.contains(&node) && active.remove(&node) {
                node.remove_client(self.id());
            }
        }
        if self.is_closed() {
            // killme already emptied the active set, these would leak
            drop(active);
            for node in added {
                node.remove_client(self.id());
            }
            return Err(BusError::ConnectionClosed);
        }
        active.extend(added);
        Ok(())
    }

    fn detach_all(&self) {
        let nodes = std::mem::take(&mut *self.active.lock());
        for node in nodes {
            node.remove_client(self.id());
        }
    }

    /// Terminates the connection, only the first call has any effect.
    pub fn killme(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.detach_all();
        self.manager.remove_connection(self.id());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({}, {}, closed: {})", self.id(), self.remote_addr, self.is_closed())
    }
}

async fn write_loop(
    id: ConnectionId,
    remote_addr: SocketAddr,
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        log::debug!("{remote_addr} {id} write error, {e}");
                        cancel.cancel();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    //flush what is already queued, error frames included
    rx.close();
    while let Ok(frame) = rx.try_recv() {
        if let Err(e) = writer.send(frame).await {
            log::debug!("{remote_addr} {id} write error while closing, {e}");
            break;
        }
    }
    if let Err(e) = writer.close().await {
        log::debug!("{remote_addr} {id} close error, {e}");
    }
    cancel.cancel();
    log::debug!("{remote_addr} {id} exit write loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_deliver_full_queue() {
        let (peer, mut rx) = Peer::test_pair(1);
        assert!(peer.deliver(Frame::ping(1)).is_ok());
        assert!(matches!(peer.deliver(Frame::ping(2)), Err(TrySendError::Full(_))));
        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(matches!(peer.deliver(Frame::ping(3)), Err(TrySendError::Closed(_))));
        assert!(matches!(peer.send(Frame::ping(4)).await, Err(BusError::ConnectionClosed)));
    }
}
