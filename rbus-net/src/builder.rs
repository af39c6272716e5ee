use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use rbus_codec::MAX_FRAME_SIZE;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::stream::BusStream;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct Builder {
    /// The name of the server.
    pub name: String,
    ///The local address the server listens on.
    pub laddr: SocketAddr,
    ///The maximum length of the pending TCP connection queue.
    pub backlog: i32,
    ///Sets the value of the TCP_NODELAY option on this socket.
    pub nodelay: bool,
    ///Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    ///Whether to enable the SO_REUSEPORT option.
    pub reuseport: Option<bool>,
    ///The maximum number of concurrent connections allowed by the listener.
    pub max_connections: usize,
    ///Maximum allowed length prefix of a frame, capped at 15M.
    pub max_frame_size: u32,
    ///Maximum raw payload size following a publish header. 0 means unlimited
    pub max_payload_size: u32,
    ///Send timeout, 0 disables it.
    pub send_timeout: Duration,
    ///Maximum number of frames waiting to be written to one connection
    pub max_mqueue_len: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 20100)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_connections: 1_000_000,
            max_frame_size: MAX_FRAME_SIZE,
            max_payload_size: 0,
            send_timeout: Duration::from_secs(10),
            max_mqueue_len: 1000,
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn reuseport(mut self, reuseport: Option<bool>) -> Self {
        self.reuseport = reuseport;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn max_mqueue_len(mut self, max_mqueue_len: usize) -> Self {
        self.max_mqueue_len = max_mqueue_len;
        self
    }

    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_linger(Some(Duration::from_secs(10)))?;

        builder.set_nonblocking(true)?;

        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        #[cfg(not(windows))]
        if let Some(reuseport) = self.reuseport {
            builder.set_reuse_port(reuseport)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let tcp_listener = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        log::info!("rbus broker listening on {} {}", self.name, tcp_listener.local_addr()?);
        Ok(Listener { cfg: Arc::new(self), tcp_listener })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    tcp_listener: TcpListener,
}

impl Listener {
    /// Actual bound address, useful when listening on port 0.
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        if let Err(e) = socket.set_nodelay(self.cfg.nodelay) {
            return Err(Error::from(e));
        }
        Ok(Acceptor { socket, remote_addr, cfg: self.cfg.clone() })
    }
}

pub struct Acceptor<S> {
    pub(crate) socket: S,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl Acceptor<TcpStream> {
    #[inline]
    pub fn tcp(self) -> BusStream {
        BusStream::new(self.socket, self.remote_addr, self.cfg)
    }
}
