//! Client-side connector.
//!
//! Resolves the configured host, tries every address in turn and, unless `sync_connect` is set,
//! keeps retrying at a fixed interval, reporting each failure to the [`EventHandler`].

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use rbus_codec::types::SubscriptionOp;
use rbus_codec::{BusCodec, Frame, Packet, MAX_FRAME_SIZE};
use rbus_net::Result;
use rbus_utils::deserialize_duration;

use crate::types::{CorrelationId, HashMap};

//unanswered pings kept for round-trip timing, the oldest is forgotten first
const MAX_PENDING_PINGS: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "ClientConfig::host_default")]
    pub host: String,
    #[serde(default = "ClientConfig::port_default")]
    pub port: u16,
    ///Connect once and fail, instead of retrying in the background
    #[serde(default = "ClientConfig::sync_connect_default")]
    pub sync_connect: bool,
    #[serde(
        default = "ClientConfig::connect_retry_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_retry_interval: Duration,
    #[serde(default = "ClientConfig::max_frame_size_default")]
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: Self::host_default(),
            port: Self::port_default(),
            sync_connect: Self::sync_connect_default(),
            connect_retry_interval: Self::connect_retry_interval_default(),
            max_frame_size: Self::max_frame_size_default(),
        }
    }
}

impl ClientConfig {
    fn host_default() -> String {
        "localhost".into()
    }

    fn port_default() -> u16 {
        20100
    }

    fn sync_connect_default() -> bool {
        true
    }

    fn connect_retry_interval_default() -> Duration {
        Duration::from_millis(500)
    }

    fn max_frame_size_default() -> u32 {
        MAX_FRAME_SIZE
    }
}

/// Connection lifecycle callbacks.
pub trait EventHandler: Send + Sync {
    fn connect_error(&self, _err: &io::Error) {}

    fn connected(&self, _addr: SocketAddr) {}
}

/// Handler that ignores every event.
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

pub struct Client {
    io: Framed<TcpStream, BusCodec>,
    peer_addr: SocketAddr,
    pings: HashMap<CorrelationId, Instant>,
    next_ping: CorrelationId,
    last_rtt: Option<Duration>,
}

impl Client {
    pub async fn connect<H: EventHandler>(cfg: &ClientConfig, handler: &H) -> Result<Client> {
        loop {
            match Self::try_connect(cfg).await {
                Ok((socket, peer_addr)) => {
                    log::info!("Connected to {peer_addr}");
                    handler.connected(peer_addr);
                    let codec = BusCodec::client().max_frame_size(cfg.max_frame_size);
                    return Ok(Client {
                        io: Framed::new(socket, codec),
                        peer_addr,
                        pings: HashMap::default(),
                        next_ping: 0,
                        last_rtt: None,
                    });
                }
                Err(e) if cfg.sync_connect => return Err(e.into()),
                Err(e) => {
                    log::warn!("Connection error, {e}, retrying in {:?}", cfg.connect_retry_interval);
                    handler.connect_error(&e);
                    tokio::time::sleep(cfg.connect_retry_interval).await;
                }
            }
        }
    }

    async fn try_connect(cfg: &ClientConfig) -> io::Result<(TcpStream, SocketAddr)> {
        log::debug!("Resolving: {}:{}", cfg.host, cfg.port);
        let mut last_err = None;
        for addr in tokio::net::lookup_host((cfg.host.as_str(), cfg.port)).await? {
            log::info!("Trying to connect to: {addr}");
            match TcpStream::connect(addr).await {
                Ok(socket) => return Ok((socket, addr)),
                Err(e) => {
                    log::warn!("Could not connect to: {addr}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no more host to try")))
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Round-trip time of the most recently answered ping.
    #[inline]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Sends a ping and returns its correlation id.
    pub async fn ping(&mut self) -> Result<CorrelationId> {
        self.next_ping = self.next_ping.wrapping_add(1);
        let correlation_id = self.next_ping;
        if self.pings.len() >= MAX_PENDING_PINGS {
            if let Some(oldest) = self.pings.iter().min_by_key(|(_, sent)| **sent).map(|(id, _)| *id) {
                self.pings.remove(&oldest);
            }
        }
        self.pings.insert(correlation_id, Instant::now());
        self.io.send(Frame::ping(correlation_id)).await?;
        Ok(correlation_id)
    }

    #[inline]
    pub async fn subscribe(&mut self, route_prefix: &str, correlation_id: CorrelationId) -> Result<()> {
        self.update(&[SubscriptionOp::Subscribe { route_prefix: route_prefix.to_owned().into(), correlation_id }])
            .await
    }

    #[inline]
    pub async fn unsubscribe(&mut self, route_prefix: &str) -> Result<()> {
        self.update(&[SubscriptionOp::Unsubscribe { route_prefix: route_prefix.to_owned().into() }]).await
    }

    #[inline]
    pub async fn unsubscribe_all(&mut self) -> Result<()> {
        self.update(&[SubscriptionOp::UnsubscribeAll]).await
    }

    /// Sends several subscription operations in one request.
    pub async fn update(&mut self, ops: &[SubscriptionOp]) -> Result<()> {
        self.io.send(Frame::subscribe(ops)).await?;
        Ok(())
    }

    pub async fn publish(&mut self, route: &str, payload: Bytes) -> Result<()> {
        self.io.send(Frame::publish(route, payload)).await?;
        Ok(())
    }

    /// Next packet from the broker, `None` once the broker closed the connection.
    ///
    /// Pings from the broker are answered here and not returned.
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        loop {
            let packet = match self.io.next().await {
                Some(packet) => packet?,
                None => return Ok(None),
            };
            match packet {
                Packet::Ping { correlation_id } => self.io.send(Frame::pong(correlation_id)).await?,
                Packet::Pong { correlation_id } => {
                    if let Some(sent) = self.pings.remove(&correlation_id) {
                        //pongs come back in order, older pings will never be answered
                        self.pings.retain(|_, s| *s > sent);
                        let rtt = sent.elapsed();
                        log::debug!("{} latency: {:?}", self.peer_addr, rtt);
                        self.last_rtt = Some(rtt);
                    }
                    return Ok(Some(packet));
                }
                Packet::Error { kind, ref description } => {
                    log::warn!("{} broker error {:?}: {}", self.peer_addr, kind, description);
                    return Ok(Some(packet));
                }
                packet => return Ok(Some(packet)),
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.io.close().await?;
        Ok(())
    }
}
