#![deny(unsafe_code)]

use rbus::broker::Broker;
use rbus::logger::logger_init;
use rbus::net::Builder;
use rbus::server::BusServer;
use rbus::settings::{Listener, Options, Settings};
use rbus::{log, structopt::StructOpt, Result};

fn main() -> Result<()> {
    //init config
    let cfg = Settings::init(Options::from_args())?;

    //init log
    let _logger = logger_init(&cfg.log)?;

    Settings::logs();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.task.worker_threads)
        .thread_name("rbus-worker")
        .enable_all()
        .build()?
        .block_on(run(cfg))
}

async fn run(cfg: &'static Settings) -> Result<()> {
    let broker = Broker::new(cfg.broker.shutdown_timeout);

    let mut server = BusServer::new(broker.clone());
    for listen_cfg in cfg.listeners.tcps.values() {
        server = server.listener(builder(listen_cfg).bind()?);
    }
    server.build().start();

    shutdown_signal().await?;
    log::info!("shutdown requested, stats: {}", broker.stats());
    broker.shutdown().await;
    Ok(())
}

fn builder(l: &Listener) -> Builder {
    Builder::new()
        .name(l.name.clone())
        .laddr(l.addr)
        .backlog(l.backlog)
        .nodelay(l.nodelay)
        .reuseaddr(l.reuseaddr)
        .reuseport(l.reuseport)
        .max_connections(l.max_connections)
        .max_frame_size(l.max_frame_size.as_u32())
        .max_payload_size(l.max_payload_size.as_u32())
        .max_mqueue_len(l.max_mqueue_len)
        .send_timeout(l.send_timeout)
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
