#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rbus_net::Result;
use rbus_utils::*;

use self::listener::Listeners;
use self::logging::Log;

pub use self::listener::Listener;
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub log: Log,
    #[serde(rename = "listener")]
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rbus/rbus").required(false))
            .add_source(File::with_name("rbus").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("rbus").prefix_separator("_").separator("__").try_parsing(true),
        );

        Ok(Self(Arc::new(Self::build(builder, opts)?)))
    }

    fn build(builder: ConfigBuilder<DefaultState>, opts: Options) -> Result<Inner> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        inner.listeners.init();

        //Command line configuration overriding file configuration
        if opts.addr.is_some() {
            inner.listeners.tcps.clear();
        }
        if inner.listeners.tcps.is_empty() {
            inner.listeners.set_default(opts.addr);
        }
        if let Some(worker_threads) = opts.worker_threads {
            inner.task.worker_threads = worker_threads;
        }
        if opts.debug {
            inner.log.level = logging::Level::new(slog::Level::Debug);
        }

        inner.opts = opts;
        Ok(inner)
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("worker_threads is {}", cfg.task.worker_threads);
        log::info!("shutdown_timeout is {:?}", cfg.broker.shutdown_timeout);
        for l in cfg.listeners.tcps.values() {
            log::info!("listener {} on {}, max_mqueue_len: {}", l.name, l.addr, l.max_mqueue_len);
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    //Worker threads of the I/O runtime.
    #[serde(default = "Task::worker_threads_default")]
    pub worker_threads: usize,
}

impl Default for Task {
    #[inline]
    fn default() -> Self {
        Self { worker_threads: Self::worker_threads_default() }
    }
}

impl Task {
    fn worker_threads_default() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    //How long shutdown waits for live connections to drain, 0 waits forever.
    #[serde(default = "Broker::shutdown_timeout_default", deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self { shutdown_timeout: Self::shutdown_timeout_default() }
    }
}

impl Broker {
    fn shutdown_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str, opts: Options) -> Inner {
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Settings::build(builder, opts).unwrap()
    }

    #[test]
    fn test_defaults() {
        let inner = parse("", Options::default());
        assert!(inner.task.worker_threads > 0);
        assert_eq!(inner.broker.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(inner.log.level.inner(), slog::Level::Info);
        let l = inner.listeners.tcp(20100).unwrap();
        assert_eq!(l.name, "external/tcp");
        assert_eq!(l.max_frame_size.as_u32(), 15 * 1024 * 1024);
        assert_eq!(l.max_payload_size.as_u32(), 0);
        assert_eq!(l.send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_listener_section() {
        let inner = parse(
            r#"
            [task]
            worker_threads = 3

            [log]
            to = "off"
            level = "warn"

            [broker]
            shutdown_timeout = "5s"

            [listener.tcp.internal]
            addr = "127.0.0.1:20200"
            max_frame_size = "1M"
            max_mqueue_len = 16
            send_timeout = "500ms"

            [listener.tcp.disabled]
            enable = false
            addr = "127.0.0.1:20300"
            "#,
            Options::default(),
        );
        assert_eq!(inner.task.worker_threads, 3);
        assert!(inner.log.to.off());
        assert_eq!(inner.log.level.inner(), slog::Level::Warning);
        assert_eq!(inner.broker.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(inner.listeners.tcps.len(), 1);
        let l = inner.listeners.tcp(20200).unwrap();
        assert_eq!(l.name, "internal/tcp");
        assert_eq!(l.max_frame_size.as_usize(), 1024 * 1024);
        assert_eq!(l.max_mqueue_len, 16);
        assert_eq!(l.send_timeout, Duration::from_millis(500));
        assert!(inner.listeners.tcp(20300).is_none());
    }

    #[test]
    fn test_command_line_overrides() {
        let opts = Options {
            addr: Some("0.0.0.0:10900".parse().unwrap()),
            worker_threads: Some(2),
            debug: true,
            ..Default::default()
        };
        let inner = parse("[listener.tcp.external]\naddr = \"0.0.0.0:20100\"\n", opts);
        assert_eq!(inner.listeners.tcps.len(), 1);
        assert!(inner.listeners.tcp(10900).is_some());
        assert_eq!(inner.task.worker_threads, 2);
        assert_eq!(inner.log.level.inner(), slog::Level::Debug);
    }
}
