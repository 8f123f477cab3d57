//! Logging backend. See ["log" crate documentation](https://docs.rs/log/)
//! for the frontend macros.
//!
//! Records are written to stderr as `<priority>[domain] message` lines,
//! with syslog-style priorities. Per-domain thresholds come from the
//! `SPINDLE_LOG_LEVELS` environment variable, a comma-separated list of
//! `domain:level` pairs (e.g. `SPINDLE_LOG_LEVELS=spindle:7`), parsed
//! once; unlisted domains default to warning.

use std::collections::HashMap;
use std::io::Write;

use log::{Level, Log, Metadata, Record};
use once_cell::sync::Lazy;

const DEFAULT_PRIORITY: u8 = Priority::Warning as u8;

/// Syslog-style priorities used on the wire format of the log lines.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum Priority {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl From<Level> for Priority {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Priority::Error,
            Level::Warn => Priority::Warning,
            Level::Info => Priority::Info,
            Level::Debug | Level::Trace => Priority::Debug,
        }
    }
}

static DOMAIN_LEVELS: Lazy<HashMap<String, u8>> = Lazy::new(|| {
    let mut levels = HashMap::new();
    let env = match std::env::var("SPINDLE_LOG_LEVELS") {
        Ok(env) => env,
        Err(_) => return levels,
    };
    for entry in env.split(',') {
        let mut parts = entry.splitn(2, ':');
        let domain = match parts.next() {
            Some(d) if !d.is_empty() => d,
            _ => continue,
        };
        if let Some(Ok(level)) = parts.next().map(str::parse::<u8>) {
            levels.insert(domain.trim().to_owned(), level);
        }
    }
    levels
});

fn domain_threshold(domain: &str) -> u8 {
    DOMAIN_LEVELS
        .get(domain)
        .copied()
        .unwrap_or(DEFAULT_PRIORITY)
}

/// [`Log`] implementation writing domain-tagged lines to stderr.
pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        Priority::from(metadata.level()) as u8 <= domain_threshold(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let priority = Priority::from(record.level()) as u8;
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(out, "<{}>[{}] {}", priority, record.target(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs [`StderrLogger`] as the process logger. Idempotent; a
/// logger installed by the embedding application wins.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}
