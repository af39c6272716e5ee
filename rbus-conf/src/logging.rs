//! The `[log]` section.

use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer, Unexpected};
use serde::Deserialize;

/// Log destination and verbosity.
///
/// ```toml
/// [log]
/// to = "both"
/// level = "debug"
/// dir = "/var/log/rbus"
/// file = "rbus.log"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: PathBuf,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level::new(slog::Level::Info), dir: "/var/log/rbus".into(), file: "rbus.log".into() }
    }
}

impl Log {
    /// Path of the log file, `file` relative to `dir`.
    #[inline]
    pub fn filename(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    const VARIANTS: &'static [&'static str] = &["off", "file", "console", "both"];

    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }

    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = String::deserialize(deserializer)?;
        match to.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            _ => Err(de::Error::unknown_variant(&to, To::VARIANTS)),
        }
    }
}

/// A `slog` level read from its name, `warn` and `warning` both accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn new(level: slog::Level) -> Self {
        Level(level)
    }

    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        //slog panics on "off", it names a filter and not a record level
        if level.eq_ignore_ascii_case("off") {
            return Err(de::Error::invalid_value(Unexpected::Str(&level), &"a record level, use `to = \"off\"`"));
        }
        match slog::Level::from_str(&level) {
            Ok(l) => Ok(Level(l)),
            Err(()) if level.eq_ignore_ascii_case("warning") => Ok(Level(slog::Level::Warning)),
            Err(()) => Err(de::Error::invalid_value(
                Unexpected::Str(&level),
                &"one of critical, error, warn, info, debug, trace",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    fn parse(toml: &str) -> Result<Log, config::ConfigError> {
        Config::builder().add_source(File::from_str(toml, FileFormat::Toml)).build()?.try_deserialize()
    }

    #[test]
    fn test_defaults() {
        let log = parse("").unwrap();
        assert_eq!(log.to, To::Console);
        assert_eq!(log.level.inner(), slog::Level::Info);
        assert_eq!(log.filename(), PathBuf::from("/var/log/rbus/rbus.log"));
    }

    #[test]
    fn test_destinations() {
        for (name, to) in [("off", To::Off), ("FILE", To::File), ("Console", To::Console), ("both", To::Both)] {
            assert_eq!(parse(&format!("to = \"{name}\"")).unwrap().to, to);
        }
        assert!(To::Both.file() && To::Both.console());
        assert!(!To::Off.file() && !To::Off.console());
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let err = parse("to = \"consol\"").unwrap_err().to_string();
        assert!(err.contains("consol"), "{err}");
        assert!(err.contains("both"), "{err}");
    }

    #[test]
    fn test_levels() {
        assert_eq!(parse("level = \"warning\"").unwrap().level.inner(), slog::Level::Warning);
        assert_eq!(parse("level = \"trace\"").unwrap().level.inner(), slog::Level::Trace);
        assert!(parse("level = \"loud\"").is_err());
        assert!(parse("level = \"off\"").is_err());
    }
}
