//! Logging setup
//!
//! Structured logging through `tracing`. `TABCAST_LOG` (an `EnvFilter`
//! directive string) overrides the configured level and module directives.
//! Text goes to stderr so that event output on stdout stays clean; with a
//! log file configured, a daily-rotated file gets a copy without colors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::ConfigError;

pub const LOG_ENV: &str = "TABCAST_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, off
    pub level: String,

    /// Also write to this file, rotated daily
    pub file: Option<PathBuf>,

    /// ANSI colors on stderr
    pub color: bool,

    /// Per-module levels, e.g. `tabcast::channel = "debug"`
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            modules: HashMap::new(),
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should flush.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = build_filter(config)?;
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_ansi(config.color)
        .with_writer(std::io::stderr);

    let base = Registry::default().with(filter).with(stderr_layer);

    match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .ok_or_else(|| ConfigError::Invalid(format!("log file {path:?} has no name")))?;
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Read {
                path: dir.clone(),
                source,
            })?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, name));
            base.with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init()
            .map_err(|e| ConfigError::Invalid(format!("logging already initialized: {e}")))?;
            Ok(Some(guard))
        }
        None => {
            base.try_init()
                .map_err(|e| ConfigError::Invalid(format!("logging already initialized: {e}")))?;
            Ok(None)
        }
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| ConfigError::Invalid(format!("log level {:?}: {e}", config.level)))?;

    for (module, level) in &config.modules {
        let directive = format!("{module}={level}");
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("log directive {directive:?}: {e}")))?,
        );
    }

    Ok(filter)
}
