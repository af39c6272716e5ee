use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{deserialize_addr, deserialize_duration, Bytesize};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

type Port = u16;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Listeners {
    #[serde(rename = "tcp")]
    #[serde(default)]
    _tcps: HashMap<String, ListenerInner>,

    #[serde(default, skip)]
    pub tcps: HashMap<Port, Listener>,
}

impl Listeners {
    #[inline]
    pub(crate) fn init(&mut self) {
        for (name, mut inner) in self._tcps.drain() {
            if inner.enable {
                inner.name = format!("{name}/tcp");
                self.tcps.insert(inner.addr.port(), Listener::new(inner));
            }
        }
    }

    #[inline]
    pub fn tcp(&self, port: u16) -> Option<Listener> {
        self.tcps.get(&port).cloned()
    }

    #[inline]
    pub(crate) fn set_default(&mut self, addr: Option<SocketAddr>) {
        let mut inner = ListenerInner::default();
        if let Some(addr) = addr {
            inner.addr = addr;
        }
        self.tcps.insert(inner.addr.port(), Listener::new(inner));
    }
}

#[derive(Debug, Clone, Default)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    #[inline]
    fn new(inner: ListenerInner) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

impl Deref for Listener {
    type Target = ListenerInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerInner {
    #[serde(default)]
    pub name: String,
    #[serde(default = "ListenerInner::enable_default")]
    pub enable: bool,
    #[serde(default = "ListenerInner::addr_default", deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    #[serde(default = "ListenerInner::max_connections_default")]
    pub max_connections: usize,
    #[serde(default = "ListenerInner::max_frame_size_default")]
    pub max_frame_size: Bytesize,
    #[serde(default)]
    pub max_payload_size: Bytesize,
    #[serde(default = "ListenerInner::backlog_default")]
    pub backlog: i32,
    #[serde(default = "ListenerInner::nodelay_default")]
    pub nodelay: bool,
    #[serde(default = "ListenerInner::reuseaddr_default")]
    pub reuseaddr: Option<bool>,
    #[serde(default)]
    pub reuseport: Option<bool>,
    #[serde(default = "ListenerInner::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
    #[serde(default = "ListenerInner::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
}

impl Default for ListenerInner {
    fn default() -> Self {
        Self {
            name: "external/tcp".into(),
            enable: ListenerInner::enable_default(),
            addr: ListenerInner::addr_default(),
            max_connections: ListenerInner::max_connections_default(),
            max_frame_size: ListenerInner::max_frame_size_default(),
            max_payload_size: Bytesize(0),
            backlog: ListenerInner::backlog_default(),
            nodelay: ListenerInner::nodelay_default(),
            reuseaddr: ListenerInner::reuseaddr_default(),
            reuseport: None,
            max_mqueue_len: ListenerInner::max_mqueue_len_default(),
            send_timeout: ListenerInner::send_timeout_default(),
        }
    }
}

impl ListenerInner {
    fn enable_default() -> bool {
        true
    }
    #[inline]
    fn addr_default() -> SocketAddr {
        ([0, 0, 0, 0], 20100).into()
    }
    #[inline]
    fn max_connections_default() -> usize {
        1024000
    }
    #[inline]
    fn max_frame_size_default() -> Bytesize {
        Bytesize(15 * 1024 * 1024)
    }
    #[inline]
    fn backlog_default() -> i32 {
        1024
    }
    #[inline]
    fn nodelay_default() -> bool {
        true
    }
    #[inline]
    fn reuseaddr_default() -> Option<bool> {
        Some(true)
    }
    #[inline]
    fn max_mqueue_len_default() -> usize {
        1000
    }
    #[inline]
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
}
