//! Log setup and the JSON-lines log format
//!
//! Everything logs through the `log` facade. [`init`] installs env_logger
//! with either its plain text format or one [`LogEntry`] JSON object per
//! line, suitable for jq.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Error => LogLevel::Error,
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp (RFC3339)
    pub timestamp: String,

    pub level: LogLevel,

    /// Module that logged
    pub component: String,

    pub message: String,

    /// Extra fields, flattened into the object
    #[serde(flatten, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            level,
            component: component.into(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Add key-value pair to data
    pub fn add_field(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.data {
            map.insert(key.to_string(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), value);
            self.data = serde_json::Value::Object(map);
        }
        self
    }

    /// Serialize as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger already initialised: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

/// Install the global logger
///
/// `RUST_LOG` is honoured on top of the default level (`info`, or `debug`
/// when `verbose`). With `log_dir` set, output goes to
/// `<log_dir>/dnsdrip-<role>.log` instead of stderr.
pub fn init(
    verbose: bool,
    format: LogFormat,
    log_dir: Option<&Path>,
    role: &str,
) -> Result<(), LoggingError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    builder.parse_default_env();

    if format == LogFormat::Json {
        let role = role.to_string();
        builder.format(move |buf, record| {
            let entry = LogEntry::new(
                record.level().into(),
                record.module_path().unwrap_or_else(|| record.target()),
                record.args().to_string(),
            )
            .add_field("role", serde_json::Value::String(role.clone()));
            writeln!(buf, "{}", entry.to_line())
        });
    }

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("dnsdrip-{}.log", role)))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}
