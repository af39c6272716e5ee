#![deny(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use simple_logger::SimpleLogger;

use rbus::bytes::Bytes;
use rbus::client::{Client, ClientConfig, EventHandler};
use rbus::codec::Packet;
use rbus::{log, structopt::StructOpt, Result};

#[derive(StructOpt, Debug)]
#[structopt(name = "rbus-client")]
struct Args {
    #[structopt(long, default_value = "localhost")]
    host: String,

    #[structopt(long, default_value = "20100")]
    port: u16,

    /// Route-prefix to subscribe to, may be repeated. Correlation ids follow the order given.
    #[structopt(short = "s", long = "subscribe")]
    subscribe: Vec<String>,

    /// Route to publish `--message` to once connected
    #[structopt(short = "p", long = "publish")]
    publish: Option<String>,

    #[structopt(short = "m", long = "message", default_value = "")]
    message: String,

    /// Seconds between latency probes
    #[structopt(long = "ping-interval", default_value = "5")]
    ping_interval: u64,
}

struct Handler;

impl EventHandler for Handler {
    fn connect_error(&self, err: &io::Error) {
        log::warn!("connect error: {err}");
    }

    fn connected(&self, addr: SocketAddr) {
        log::info!("connected to {addr}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init()?;

    let args = Args::from_args();
    let cfg = ClientConfig { host: args.host.clone(), port: args.port, sync_connect: false, ..Default::default() };
    let mut client = Client::connect(&cfg, &Handler).await?;

    for (i, prefix) in args.subscribe.iter().enumerate() {
        client.subscribe(prefix, i as i32 + 1).await?;
    }
    if let Some(route) = args.publish.as_deref() {
        client.publish(route, Bytes::from(args.message.clone())).await?;
    }

    let mut ping = tokio::time::interval(Duration::from_secs(args.ping_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ping.tick() => {
                client.ping().await?;
            }
            packet = client.recv() => match packet? {
                Some(Packet::Delivery { route, correlation_id, payload }) => {
                    log::info!("[{correlation_id}] {route}: {}", String::from_utf8_lossy(&payload))
                }
                Some(Packet::Pong { .. }) => {
                    if let Some(rtt) = client.last_rtt() {
                        log::info!("latency: {rtt:?}");
                    }
                }
                Some(packet) => log::info!("{packet:?}"),
                None => {
                    log::info!("connection closed by the broker");
                    break;
                }
            }
        }
    }
    client.close().await
}
