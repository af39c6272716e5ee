use std::net::SocketAddr;

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "rbusd", about = "Topic-routed publish/subscribe broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Listen address, replaces the configured tcp listeners
    #[structopt(name = "addr", long)]
    pub addr: Option<SocketAddr>,

    /// Number of I/O worker threads
    #[structopt(name = "worker-threads", long)]
    pub worker_threads: Option<usize>,

    /// Log at debug level
    #[structopt(long)]
    pub debug: bool,
}
