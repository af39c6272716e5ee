//! Accept loops.
//!
//! ```rust,no_run
//! use rbus::broker::Broker;
//! use rbus::net::{Builder, Result};
//! use rbus::server::BusServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::default();
//!     BusServer::new(broker.clone())
//!         .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 20100).into()).bind()?)
//!         .build()
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;

use rbus_net::{Listener, Result};

use crate::broker::Broker;

pub struct BusServerBuilder {
    broker: Broker,
    listeners: Vec<Listener>,
}

impl BusServerBuilder {
    fn new(broker: Broker) -> Self {
        Self { broker, listeners: Vec::default() }
    }

    pub fn listener(mut self, listen: Listener) -> Self {
        self.listeners.push(listen);
        self
    }

    pub fn build(self) -> BusServer {
        let stop = self.broker.shutdown_token().child_token();
        BusServer { inner: Arc::new(BusServerInner { broker: self.broker, listeners: self.listeners, stop }) }
    }
}

#[derive(Clone)]
pub struct BusServer {
    inner: Arc<BusServerInner>,
}

pub struct BusServerInner {
    broker: Broker,
    listeners: Vec<Listener>,
    stop: CancellationToken,
}

impl Deref for BusServer {
    type Target = BusServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl BusServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(broker: Broker) -> BusServerBuilder {
        BusServerBuilder::new(broker)
    }

    /// Runs the accept loops in a background task.
    pub fn start(self) {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Failed to start the rbus server! {e}");
                std::process::exit(1);
            }
        });
    }

    /// Runs every accept loop until [`BusServer::stop`] or broker shutdown.
    pub async fn run(self) -> Result<()> {
        futures::future::join_all(self.listeners.iter().map(|l| self.listen_tcp(l).boxed()).collect_vec())
            .await;
        log::info!("rbus server stopped");
        Ok(())
    }

    /// Stops accepting. Live connections are left to the broker.
    #[inline]
    pub fn stop(&self) {
        self.stop.cancel();
    }

    #[inline]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    async fn listen_tcp(&self, l: &Listener) {
        loop {
            let accept = tokio::select! {
                _ = self.stop.cancelled() => break,
                accept = l.accept() => accept,
            };
            match accept {
                Ok(accept) => {
                    log::debug!("TCP connection from {}", accept.remote_addr);
                    if let Err(e) = self.broker.accept(accept.tcp()) {
                        log::info!("connection processing error: {e}");
                    }
                }
                Err(e) => {
                    log::info!("TCP listener error: {e:?}");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(1000)) => {}
                    }
                }
            }
        }
        log::info!("listener {} stopped", l.cfg.name);
    }
}
