// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::thread;

use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize};

use super::extract_guard;
use super::metrics::{IncMetric, METRICS};

/// Level used until a configuration says otherwise.
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;
/// Process tag printed when none was set.
pub const DEFAULT_INSTANCE_ID: &str = "musycc";
/// Process tag printed at the start of every line.
pub static INSTANCE_ID: OnceLock<String> = OnceLock::new();

/// Process wide sink for the `log` macros.
pub static LOGGER: Logger = Logger(Mutex::new(LoggerConfiguration {
    target: None,
    filter: LogFilter { module: None },
    format: LogFormat {
        show_level: true,
        show_log_origin: false,
    },
}));

/// Error of [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error of [`Logger::update`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
/// Cannot open the log file: {0}
pub struct LoggerUpdateError(pub std::io::Error);

/// Which records reach the sink.
#[derive(Debug)]
pub struct LogFilter {
    /// Only records whose module path starts with this prefix.
    pub module: Option<String>,
}

/// What precedes the message of a record.
#[derive(Debug)]
pub struct LogFormat {
    /// Print the level.
    pub show_level: bool,
    /// Print file and line.
    pub show_log_origin: bool,
}

/// Current logger setup.
#[derive(Debug)]
pub struct LoggerConfiguration {
    /// Output file, stdout when `None`.
    pub target: Option<std::fs::File>,
    /// Record filter.
    pub filter: LogFilter,
    /// Record format.
    pub format: LogFormat,
}

/// `log::Log` implementation shared by every card in the process.
#[derive(Debug)]
pub struct Logger(pub Mutex<LoggerConfiguration>);

impl Logger {
    /// Installs the logger. Fails when another logger is already installed.
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies `config`. Fields left out keep their current value.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        let file = match config.log_path {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .custom_flags(libc::O_NONBLOCK)
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(LoggerUpdateError)?,
            ),
            None => None,
        };

        log::set_max_level(config.level.unwrap_or(DEFAULT_LEVEL));
        let mut guard = extract_guard(self.0.lock());
        if file.is_some() {
            guard.target = file;
        }
        if let Some(show_level) = config.show_level {
            guard.format.show_level = show_level;
        }
        if let Some(show_log_origin) = config.show_log_origin {
            guard.format.show_log_origin = show_log_origin;
        }
        if config.module.is_some() {
            guard.filter.module = config.module;
        }
        Ok(())
    }

    fn passes(filter: &LogFilter, record: &Record) -> bool {
        match (&filter.module, record.module_path()) {
            (None, _) => true,
            (Some(prefix), Some(module)) => module.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }

    /// Renders `record` as one line: `<time> [<instance>:<thread>[:<level>][:<file>:<line>]] <msg>`.
    fn format_line(&self, config: &LoggerConfiguration, record: &Record) -> Option<String> {
        if !Self::passes(&config.filter, record) {
            return None;
        }

        let instance = INSTANCE_ID.get().map_or(DEFAULT_INSTANCE_ID, String::as_str);
        let mut line = format!(
            "{} [{instance}:{}",
            timestamp(),
            thread::current().name().unwrap_or("-")
        );
        if config.format.show_level {
            line.push_str(&format!(":{}", record.level()));
        }
        if config.format.show_log_origin {
            let number = record.line().map_or_else(|| "?".to_string(), |n| n.to_string());
            line.push_str(&format!(":{}:{number}", record.file().unwrap_or("?")));
        }
        line.push_str(&format!("] {}\n", record.args()));
        Some(line)
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = extract_guard(self.0.lock());
        let Some(line) = self.format_line(&guard, record) else {
            return;
        };
        let written = match guard.target.as_mut() {
            Some(file) => file.write_all(line.as_bytes()),
            None => std::io::stdout().lock().write_all(line.as_bytes()),
        };
        if written.is_err() {
            METRICS.logger.missed_log_count.inc();
        }
    }

    fn flush(&self) {}
}

/// Local wall clock time as `YYYY-MM-DDTHH:MM:SS.nnnnnnnnn`.
fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.9f")
        .to_string()
}

/// Logger settings, as found in a configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// File or named pipe receiving the log, stdout otherwise.
    pub log_path: Option<PathBuf>,
    /// Maximum level, case insensitive. `warning` is accepted for `warn`.
    #[serde(default, deserialize_with = "deserialize_level")]
    pub level: Option<LevelFilter>,
    /// Print the level of every record.
    pub show_level: Option<bool>,
    /// Print the source file and line of every record.
    pub show_log_origin: Option<bool>,
    /// Only log records from modules starting with this path.
    pub module: Option<String>,
}

/// Parses a level name the way configuration files spell it.
pub fn parse_level(name: &str) -> Result<LevelFilter, log::ParseLevelError> {
    if name.eq_ignore_ascii_case("warning") {
        return Ok(LevelFilter::Warn);
    }
    LevelFilter::from_str(name)
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Option<LevelFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    Option::<String>::deserialize(deserializer)?
        .map(|name| {
            parse_level(&name).map_err(|_| D::Error::custom(format!("unknown log level {name}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use log::Level;

    use super::*;

    fn logger(module: Option<&str>, show_level: bool, show_log_origin: bool) -> Logger {
        Logger(Mutex::new(LoggerConfiguration {
            target: None,
            filter: LogFilter {
                module: module.map(String::from),
            },
            format: LogFormat {
                show_level,
                show_log_origin,
            },
        }))
    }

    // Every upper/lower case spelling of `name`.
    fn spellings(name: &str) -> Vec<String> {
        name.chars()
            .map(|c| [c.to_ascii_lowercase(), c.to_ascii_uppercase()])
            .multi_cartesian_product()
            .map(|chars| chars.into_iter().collect())
            .unique()
            .collect()
    }

    #[test]
    fn test_parse_level_any_case() {
        for (name, level) in [
            ("off", LevelFilter::Off),
            ("error", LevelFilter::Error),
            ("warn", LevelFilter::Warn),
            ("warning", LevelFilter::Warn),
            ("info", LevelFilter::Info),
            ("debug", LevelFilter::Debug),
            ("trace", LevelFilter::Trace),
        ] {
            for spelling in spellings(name) {
                assert_eq!(parse_level(&spelling).unwrap(), level, "{spelling}");
            }
        }
        parse_level("loud").unwrap_err();
    }

    #[test]
    fn test_logger_config_json() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{"level": "Warning", "module": "musycc::devices"}"#).unwrap();
        assert_eq!(config.level, Some(LevelFilter::Warn));
        assert_eq!(config.module.as_deref(), Some("musycc::devices"));
        assert_eq!(config.show_level, None);

        let config: LoggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoggerConfig::default());

        serde_json::from_str::<LoggerConfig>(r#"{"level": "loud"}"#).unwrap_err();
        serde_json::from_str::<LoggerConfig>(r#"{"colour": true}"#).unwrap_err();
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let logger = logger(Some("musycc"), true, false);
        logger
            .update(LoggerConfig {
                show_log_origin: Some(true),
                ..Default::default()
            })
            .unwrap();
        let guard = logger.0.lock().unwrap();
        assert!(guard.format.show_level);
        assert!(guard.format.show_log_origin);
        assert_eq!(guard.filter.module.as_deref(), Some("musycc"));
        assert!(guard.target.is_none());
    }

    #[test]
    fn test_format_line_module_filter() {
        let logger = logger(Some("musycc::devices"), true, true);
        let guard = logger.0.lock().unwrap();

        let line = logger
            .format_line(
                &guard,
                &Record::builder()
                    .args(format_args!("channel 3 up"))
                    .level(Level::Warn)
                    .module_path(Some("musycc::devices::musycc::card"))
                    .file(Some("card.rs"))
                    .line(Some(42))
                    .build(),
            )
            .unwrap();
        assert!(line.contains(":WARN:card.rs:42] channel 3 up\n"), "{line}");

        let filtered = logger.format_line(
            &guard,
            &Record::builder()
                .args(format_args!("dropped"))
                .level(Level::Info)
                .module_path(Some("musycc::registry"))
                .build(),
        );
        assert!(filtered.is_none());
    }

    #[test]
    fn test_timestamp_shape() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), "2024-01-02T03:04:05.123456789".len(), "{stamp}");
        assert_eq!(&stamp[10..11], "T");
        assert_eq!(&stamp[19..20], ".");
    }

    #[test]
    fn test_format_line_bare() {
        let logger = logger(None, false, false);
        let guard = logger.0.lock().unwrap();
        let line = logger
            .format_line(
                &guard,
                &Record::builder()
                    .args(format_args!("hello"))
                    .level(Level::Error)
                    .module_path(Some("musycc"))
                    .build(),
            )
            .unwrap();
        assert!(line.ends_with("] hello\n"), "{line}");
        assert!(!line.contains("ERROR"), "{line}");
    }
}
