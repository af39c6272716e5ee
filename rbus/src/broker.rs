//! Connection manager and fan-out.
//!
//! The [`Broker`] owns the [`Router`] and the set of live connections. Publishing resolves
//! the nodes matching a route, encodes the consumer header once and enqueues one frame per
//! member; every frame shares the same payload buffer.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use rbus_codec::types::{ConsumerMessageHeader, Header, MessageType};
use rbus_codec::Frame;
use rbus_net::{BusError, BusStream, Result};
use rbus_utils::Counter;

use crate::connection::{Connection, Peer};
use crate::router::Router;
use crate::stats::Stats;
use crate::subscription::NodeHandle;
use crate::types::{ConnectionId, CorrelationId, Route};

/// What a connection needs from the component that accepted it.
pub trait Manager: Send + Sync + 'static {
    /// Registers the stream as a live connection and starts its read loop.
    fn accept(self: Arc<Self>, stream: BusStream) -> Result<ConnectionId>;

    /// Called exactly once by a terminating connection.
    fn remove_connection(&self, id: ConnectionId);

    fn subscribe(&self, batch: Vec<(Route, CorrelationId)>, peer: &Peer) -> Vec<NodeHandle>;

    fn unsubscribe(&self, batch: Vec<Route>, id: ConnectionId) -> Vec<NodeHandle>;

    /// Fans `payload` out to every subscriber of `route` or one of its ancestors.
    /// Never waits for a subscriber.
    fn publish(&self, route: Route, payload: Bytes);
}

#[derive(Clone)]
pub struct Broker(Arc<BrokerInner>);

pub struct BrokerInner {
    router: Router,
    live: DashMap<ConnectionId, Arc<Connection>, ahash::RandomState>,
    //live connections per listener name, checked against that listener's max_connections
    listeners: DashMap<String, Counter, ahash::RandomState>,
    drained: Notify,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Broker {
    /// `shutdown_timeout` bounds [`Broker::shutdown`], zero waits forever.
    pub fn new(shutdown_timeout: Duration) -> Self {
        let stats = Arc::new(Stats::default());
        Broker(Arc::new(BrokerInner {
            router: Router::new(stats.clone()),
            live: DashMap::default(),
            listeners: DashMap::default(),
            drained: Notify::new(),
            stats,
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }))
    }

    #[inline]
    pub fn accept(&self, stream: BusStream) -> Result<ConnectionId> {
        self.0.clone().accept(stream)
    }

    /// Stops accepting, signals every live connection and waits for all of them to
    /// unregister. Gives up after the shutdown timeout, if any.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        log::info!("broker shutting down, {} live connections", self.live.len());
        let drained = self.wait_drained();
        if self.shutdown_timeout.is_zero() {
            drained.await;
        } else if tokio::time::timeout(self.shutdown_timeout, drained).await.is_err() {
            let left = self.live.iter().map(|c| format!("{}({})", c.key(), c.remote_addr())).join(", ");
            log::warn!("shutdown timed out after {:?}, still live: {}", self.shutdown_timeout, left);
            return;
        }
        log::info!("broker stopped");
    }
}

impl BrokerInner {
    #[inline]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[inline]
    pub fn stats(&self) -> serde_json::Value {
        self.stats.to_json()
    }

    /// Number of live connections.
    #[inline]
    pub fn connections(&self) -> usize {
        self.live.len()
    }

    /// Number of live connections accepted by the listener `name`.
    #[inline]
    pub fn listener_connections(&self, name: &str) -> usize {
        self.listeners.get(name).map(|c| c.count().max(0) as usize).unwrap_or_default()
    }

    #[inline]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.live.get(&id).map(|c| c.value().clone())
    }

    /// Cancelled once shutdown starts. Accept loops and connections run on child tokens.
    #[inline]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Manager for BrokerInner {
    fn accept(self: Arc<Self>, stream: BusStream) -> Result<ConnectionId> {
        if self.is_shutdown() {
            log::debug!("{} rejected, broker is shutting down", stream.remote_addr);
            return Err(BusError::ServiceUnavailable.into());
        }
        {
            let max_connections = stream.cfg.max_connections;
            let count = self.listeners.entry(stream.cfg.name.clone()).or_default();
            if count.count().max(0) as usize >= max_connections {
                log::warn!(
                    "{} rejected, too many connections on {}, max: {}",
                    stream.remote_addr,
                    stream.cfg.name,
                    max_connections
                );
                return Err(BusError::ServiceUnavailable.into());
            }
            count.inc();
        }

        let token = self.shutdown.child_token();
        let (conn, reader) = Connection::new(stream, self.clone(), token);
        let id = conn.id();
        self.live.insert(id, conn.clone());
        self.stats.connections.inc();
        log::debug!("{} {} connected", conn.remote_addr(), id);
        tokio::spawn(conn.run(reader));
        Ok(id)
    }

    fn remove_connection(&self, id: ConnectionId) {
        match self.live.remove(&id) {
            Some((_, conn)) => {
                self.stats.connections.dec();
                if let Some(count) = self.listeners.get(conn.listener()) {
                    count.dec();
                }
                log::debug!("{} {} disconnected", conn.remote_addr(), id);
                if self.live.is_empty() {
                    self.drained.notify_waiters();
                }
            }
            None => log::error!("{id} is not a live connection, nothing removed"),
        }
    }

    #[inline]
    fn subscribe(&self, batch: Vec<(Route, CorrelationId)>, peer: &Peer) -> Vec<NodeHandle> {
        self.router.add(&batch, peer)
    }

    #[inline]
    fn unsubscribe(&self, batch: Vec<Route>, id: ConnectionId) -> Vec<NodeHandle> {
        self.router.remove(&batch, id)
    }

    fn publish(&self, route: Route, payload: Bytes) {
        self.stats.published.inc();
        let nodes = self.router.subscriptions_for(&route);
        if nodes.is_empty() {
            log::trace!("no subscriber for {route:?}");
            return;
        }

        let mut header = ConsumerMessageHeader {
            header: Header::of(MessageType::Message),
            route: route.to_string(),
            message_size: payload.len() as u32,
            correlation_id: 0,
        };
        for node in nodes {
            node.for_each(|peer, correlation_id| {
                header.correlation_id = correlation_id;
                match peer.deliver(Frame::delivery(&header, payload.clone())) {
                    Ok(()) => self.stats.delivered.inc(),
                    Err(TrySendError::Full(_)) => {
                        self.stats.dropped.inc();
                        log::debug!("{} queue full, dropped message on {:?}", peer.id(), route);
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::trace!("{} is closing, skipped message on {:?}", peer.id(), route)
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use prost::Message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    use rbus_codec::types::{ErrorType, SubscriptionOp};
    use rbus_codec::{BusCodec, Packet, MAX_FRAME_SIZE};
    use rbus_net::Builder;

    use super::*;

    type Client = Framed<DuplexStream, BusCodec>;

    fn connect_with(broker: &Broker, cfg: Builder, buf: usize) -> Client {
        let (server, client) = tokio::io::duplex(buf);
        let stream = BusStream::new(server, "127.0.0.1:20100".parse().unwrap(), Arc::new(cfg));
        broker.accept(stream).unwrap();
        Framed::new(client, BusCodec::client())
    }

    fn connect(broker: &Broker) -> Client {
        connect_with(broker, Builder::new(), 64 * 1024)
    }

    fn sub(prefix: &str, correlation_id: i32) -> SubscriptionOp {
        SubscriptionOp::Subscribe { route_prefix: prefix.to_owned().into(), correlation_id }
    }

    //the broker reads a connection in order, a pong proves everything before it was handled
    async fn sync(c: &mut Client, correlation_id: i32) {
        c.send(Frame::ping(correlation_id)).await.unwrap();
        assert_eq!(c.next().await.unwrap().unwrap(), Packet::Pong { correlation_id });
    }

    async fn wait_drained(broker: &Broker) {
        tokio::time::timeout(Duration::from_secs(5), broker.wait_drained()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ancestor_subscriptions_each_receive() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let mut b = connect(&broker);

        a.send(Frame::subscribe(&[sub("orders", 1), sub("orders.eu", 2)])).await.unwrap();
        sync(&mut a, 100).await;

        b.send(Frame::publish("orders.eu.de", Bytes::from_static(b"P"))).await.unwrap();
        for correlation_id in [1, 2] {
            assert_eq!(
                a.next().await.unwrap().unwrap(),
                Packet::Delivery {
                    route: "orders.eu.de".into(),
                    correlation_id,
                    payload: Bytes::from_static(b"P")
                }
            );
        }
        sync(&mut b, 101).await;
        assert_eq!(broker.stats.published.count(), 1);
        assert_eq!(broker.stats.delivered.count(), 2);
    }

    #[tokio::test]
    async fn test_delivery_wire_layout() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let mut b = connect(&broker);

        a.send(Frame::subscribe(&[sub("x", 5)])).await.unwrap();
        sync(&mut a, 1).await;
        let mut raw = a.into_inner();

        b.send(Frame::publish("x", Bytes::from_static(b"abc"))).await.unwrap();

        let header = ConsumerMessageHeader {
            header: Header::of(MessageType::Message),
            route: "x".into(),
            message_size: 3,
            correlation_id: 5,
        };
        let mut expected = (header.encoded_len() as u32).to_be_bytes().to_vec();
        expected.extend_from_slice(&header.encode_to_vec());
        expected.extend_from_slice(b"abc");

        let mut wire = vec![0u8; expected.len()];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, expected);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let mut b = connect(&broker);

        a.send(Frame::subscribe(&[sub("x", 1), sub("y", 2)])).await.unwrap();
        a.send(Frame::subscribe(&[SubscriptionOp::UnsubscribeAll])).await.unwrap();
        sync(&mut a, 1).await;
        assert!(broker.router().get("x").unwrap().is_empty());
        assert!(broker.router().get("y").unwrap().is_empty());

        b.send(Frame::publish("x", Bytes::from_static(b"1"))).await.unwrap();
        b.send(Frame::publish("y.z", Bytes::from_static(b"2"))).await.unwrap();
        sync(&mut b, 2).await;
        sync(&mut a, 3).await;
        assert_eq!(broker.stats.delivered.count(), 0);
        assert_eq!(broker.stats.subscriptions.count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_prefix_is_noop() {
        let broker = Broker::default();
        let mut a = connect(&broker);

        a.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        a.send(Frame::subscribe(&[SubscriptionOp::Unsubscribe { route_prefix: "nope".into() }]))
            .await
            .unwrap();
        sync(&mut a, 1).await;
        assert!(broker.router().get("nope").is_none());
        assert_eq!(broker.router().get("x").unwrap().len(), 1);
        assert_eq!(broker.connections(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_correlation_id() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let mut b = connect(&broker);

        a.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        a.send(Frame::subscribe(&[sub("x", 7)])).await.unwrap();
        sync(&mut a, 1).await;
        assert_eq!(broker.router().get("x").unwrap().len(), 1);

        b.send(Frame::publish("x", Bytes::from_static(b"m"))).await.unwrap();
        sync(&mut b, 2).await;
        match a.next().await.unwrap().unwrap() {
            Packet::Delivery { correlation_id, .. } => assert_eq!(correlation_id, 7),
            p => panic!("unexpected packet {p:?}"),
        }
        sync(&mut a, 3).await;
    }

    #[tokio::test]
    async fn test_add_wins_over_remove_in_one_request() {
        let broker = Broker::default();
        let mut a = connect(&broker);

        a.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        a.send(Frame::subscribe(&[
            SubscriptionOp::Unsubscribe { route_prefix: "x".into() },
            sub("x", 2),
        ]))
        .await
        .unwrap();
        sync(&mut a, 1).await;
        let node = broker.router().get("x").unwrap();
        assert_eq!(node.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_closes() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let mut b = connect(&broker);
        a.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        sync(&mut a, 1).await;

        let mut raw = vec![0, 0, 0, 10];
        raw.extend_from_slice(&[0xff; 10]);
        a.get_mut().write_all(&raw).await.unwrap();

        match a.next().await.unwrap().unwrap() {
            Packet::Error { kind, description } => {
                assert_eq!(kind, ErrorType::InvalidMessage);
                assert_eq!(description, "Could not decode the message");
            }
            p => panic!("unexpected packet {p:?}"),
        }
        assert!(a.next().await.is_none());

        sync(&mut b, 2).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connections() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(broker.router().get("x").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_closes() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        a.send(Frame::subscribe(&[SubscriptionOp::Unknown(9)])).await.unwrap();
        match a.next().await.unwrap().unwrap() {
            Packet::Error { kind, description } => {
                assert_eq!(kind, ErrorType::UnknownOperation);
                assert_eq!(description, "Unknown subscription operation");
            }
            p => panic!("unexpected packet {p:?}"),
        }
        assert!(a.next().await.is_none());
        wait_drained(&broker).await;
    }

    #[tokio::test]
    async fn test_null_frame_closes() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        a.get_mut().write_all(&[0, 0, 0, 0]).await.unwrap();
        match a.next().await.unwrap().unwrap() {
            Packet::Error { kind, .. } => assert_eq!(kind, ErrorType::PayloadTooShort),
            p => panic!("unexpected packet {p:?}"),
        }
        assert!(a.next().await.is_none());
        wait_drained(&broker).await;
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        a.get_mut().write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        match a.next().await.unwrap().unwrap() {
            Packet::Error { kind, description } => {
                assert_eq!(kind, ErrorType::PayloadTooBig);
                assert_eq!(description, "Got a payload of: 15728641B (>15728640B)");
            }
            p => panic!("unexpected packet {p:?}"),
        }
        assert!(a.next().await.is_none());
        wait_drained(&broker).await;
    }

    #[tokio::test]
    async fn test_unknown_type_closes() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        let envelope = ConsumerMessageHeader {
            header: Some(Header { kind: 42 }),
            route: "x".into(),
            message_size: 0,
            correlation_id: 0,
        };
        let mut raw = (envelope.encoded_len() as u32).to_be_bytes().to_vec();
        raw.extend_from_slice(&envelope.encode_to_vec());
        a.get_mut().write_all(&raw).await.unwrap();
        match a.next().await.unwrap().unwrap() {
            Packet::Error { kind, description } => {
                assert_eq!(kind, ErrorType::UnknownType);
                assert_eq!(description, "Unknown message type, is the server up-to-date?");
            }
            p => panic!("unexpected packet {p:?}"),
        }
        assert!(a.next().await.is_none());
        wait_drained(&broker).await;
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let broker = Broker::default();
        let mut a = connect(&broker);
        a.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        sync(&mut a, 1).await;
        assert_eq!(broker.connections(), 1);
        drop(a);
        wait_drained(&broker).await;
        assert!(broker.router().get("x").unwrap().is_empty());
        assert_eq!(broker.stats.connections.count(), 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_publisher() {
        let broker = Broker::default();
        let mut slow = connect_with(&broker, Builder::new().max_mqueue_len(2), 64);
        let mut producer = connect(&broker);

        slow.send(Frame::subscribe(&[sub("x", 1)])).await.unwrap();
        sync(&mut slow, 1).await;

        let payload = Bytes::from(vec![7u8; 1024]);
        for _ in 0..50 {
            producer.send(Frame::publish("x", payload.clone())).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), sync(&mut producer, 2)).await.unwrap();
        assert_eq!(broker.stats.published.count(), 50);
        assert!(broker.stats.dropped.count() > 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let broker = Broker::new(Duration::from_secs(5));
        let mut a = connect(&broker);
        let mut b = connect(&broker);
        sync(&mut a, 1).await;
        sync(&mut b, 2).await;

        broker.shutdown().await;
        assert_eq!(broker.connections(), 0);
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());

        let (server, _client) = tokio::io::duplex(64);
        let stream = BusStream::new(server, "127.0.0.1:20100".parse().unwrap(), Arc::new(Builder::new()));
        assert!(broker.accept(stream).is_err());
    }

    #[tokio::test]
    async fn test_max_connections() {
        let broker = Broker::default();
        let _a = connect_with(&broker, Builder::new().max_connections(1), 64);
        let (server, _client) = tokio::io::duplex(64);
        let cfg = Arc::new(Builder::new().max_connections(1));
        let err = broker.accept(BusStream::new(server, "127.0.0.1:20100".parse().unwrap(), cfg)).unwrap_err();
        assert!(matches!(err.downcast_ref::<BusError>(), Some(BusError::ServiceUnavailable)));
    }

    #[tokio::test]
    async fn test_max_connections_is_per_listener() {
        let broker = Broker::default();
        let external = Builder::new().name("external/tcp").max_connections(1000);
        let internal = Builder::new().name("internal/tcp").max_connections(2);
        let mut ext = (0..3).map(|_| connect_with(&broker, external.clone(), 64)).collect_vec();
        let mut int = (0..2).map(|_| connect_with(&broker, internal.clone(), 64)).collect_vec();
        assert_eq!(broker.listener_connections("external/tcp"), 3);
        assert_eq!(broker.listener_connections("internal/tcp"), 2);

        let (server, _client) = tokio::io::duplex(64);
        let stream = BusStream::new(server, "127.0.0.1:20100".parse().unwrap(), Arc::new(internal.clone()));
        let err = broker.accept(stream).unwrap_err();
        assert!(matches!(err.downcast_ref::<BusError>(), Some(BusError::ServiceUnavailable)));
        let _more = connect_with(&broker, external.clone(), 64);

        //a closed connection frees its slot on its own listener only
        let c = int.pop().unwrap();
        sync(&mut ext[0], 1).await;
        drop(c);
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.listener_connections("internal/tcp") != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.listener_connections("external/tcp"), 4);
        let _again = connect_with(&broker, internal, 64);
        assert_eq!(broker.listener_connections("internal/tcp"), 2);
        sync(&mut int[0], 2).await;
    }

    #[tokio::test]
    async fn test_remove_unknown_connection_is_not_fatal() {
        let broker = Broker::default();
        broker.remove_connection(ConnectionId::next());
        assert_eq!(broker.connections(), 0);
    }
}
