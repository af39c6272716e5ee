#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use rbus::broker::Broker;
//! use rbus::net::{Builder, Result};
//! use rbus::server::BusServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!    let broker = Broker::default();
//!
//!    BusServer::new(broker)
//!       .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 20100).into()).bind()?)
//!       .listener(Builder::new().name("internal/tcp").laddr(([127, 0, 0, 1], 20101).into()).bind()?)
//!       .build()
//!       .run()
//!       .await?;
//!    Ok(())
//! }
//!
//! ```

pub mod broker; // Live connections, fan-out, shutdown
pub mod client; // Client-side connector
pub mod connection; // Per-connection read loop and writer
pub mod logger;
pub mod router; // Route-prefix index
pub mod server; // Accept loops
pub mod stats;
pub mod subscription; // Membership of one route-prefix
pub mod types;

pub use net::{Error, Result};

pub use rbus_codec as codec;
pub use rbus_conf as settings;
pub use rbus_net as net;
pub use rbus_utils as utils;

pub use anyhow;
pub use bytes;
pub use bytestring;
pub use log;
pub use serde_json;
pub use structopt;
pub use tokio;
