use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use slog::{o, Drain};

use rbus_conf::logging::{Log, To};
use rbus_net::Result;

pub use slog::Logger;

/// Builds the root logger from `cfg` and routes the `log` facade into it.
pub fn logger_init(cfg: &Log) -> Result<Logger> {
    let logger = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))?;
    log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
    Ok(logger)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(cfg: &Log) -> Result<Logger> {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(cfg)?);
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();

    let drain = drain.filter_level(cfg.level.inner()).ignore_res();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(slog::Logger::root(drain, o!()))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(cfg: &Log) -> Result<Self> {
        let file = if cfg.to.file() { Some(open_file(&cfg.filename())?) } else { None };
        Ok(Self { to: cfg.to, file, console: io::stdout() })
    }

    fn write_file(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.write_file(buf)?,
            To::Both => {
                self.console.write_all(buf)?;
                self.write_file(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &Path) -> Result<File> {
    if let Some(dir) = filename.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::Error::msg(format!("logger dir config error, dir: {dir:?}, {e:?}")))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow::Error::msg(format!("logger file config error, filename: {filename:?}, {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_cfg(to: To, dir: &Path) -> Log {
        Log { to, dir: dir.to_path_buf(), file: "rbus-test.log".into(), ..Default::default() }
    }

    #[test]
    fn test_write_filter_file() {
        let dir = std::env::temp_dir().join(format!("rbus-logger-{}", std::process::id()));
        let cfg = log_cfg(To::File, &dir);
        let mut w = WriteFilter::new(&cfg).unwrap();
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();
        let text = std::fs::read_to_string(cfg.filename()).unwrap();
        assert!(text.ends_with("hello\n"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_write_filter_both_writes_whole_buffer() {
        let dir = std::env::temp_dir().join(format!("rbus-logger-both-{}", std::process::id()));
        let cfg = log_cfg(To::Both, &dir);
        let mut w = WriteFilter::new(&cfg).unwrap();
        let line = vec![b'x'; 4096];
        assert_eq!(w.write(&line).unwrap(), line.len());
        w.flush().unwrap();
        assert_eq!(std::fs::read(cfg.filename()).unwrap().len(), line.len());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_off_opens_nothing() {
        let dir = std::env::temp_dir().join(format!("rbus-logger-off-{}", std::process::id()));
        let cfg = log_cfg(To::Off, &dir);
        let logger = config_logger(&cfg).unwrap();
        slog::info!(logger, "dropped");
        assert!(!dir.exists());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
    }
}
