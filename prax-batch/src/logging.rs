//! Logging setup for batch execution.
//!
//! The executor and the drivers log through `tracing`: batch start and finish
//! at `info`, dispatches and reaps at `debug`, retries, timeouts and failed
//! statements at `warn`. Nothing is printed unless a subscriber is installed,
//! either by the application or by [`init`] when the `tracing-subscriber`
//! feature is enabled.
//!
//! # Environment Variables
//!
//! - `PRAX_DEBUG=true|1|yes` - Enable debug logging
//! - `PRAX_LOG_LEVEL=trace|debug|info|warn|error` - Set a specific level
//! - `PRAX_LOG_FORMAT=json|pretty|compact` - Output format (default: json)
//!
//! ```rust,no_run
//! use prax_batch::logging;
//!
//! logging::init();
//! ```

use std::sync::Once;

use crate::config::{EnvSource, StdEnvSource};

static INIT: Once = Once::new();

/// Crates whose events the installed filter lets through.
const TARGETS: [&str; 3] = ["prax_batch", "prax_mysql", "prax_async"];

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Logging settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Whether logging was requested at all.
    pub enabled: bool,
    /// Level applied to every target.
    pub level: &'static str,
    /// Output format.
    pub format: LogFormat,
}

impl LogSettings {
    /// Read settings from an environment source.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let debug = env
            .get("PRAX_DEBUG")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"));
        let explicit = env.get("PRAX_LOG_LEVEL").and_then(|v| parse_level(&v));
        let level = explicit.unwrap_or(if debug { "debug" } else { "warn" });

        Self {
            enabled: debug || env.get("PRAX_LOG_LEVEL").is_some(),
            level,
            format: env
                .get("PRAX_LOG_FORMAT")
                .map_or(LogFormat::Json, |f| LogFormat::parse(&f)),
        }
    }

    /// The `EnvFilter` directive for these settings.
    pub fn directive(&self) -> String {
        TARGETS
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_level(value: &str) -> Option<&'static str> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Check if debug or trace logging is requested.
pub fn is_debug_enabled() -> bool {
    matches!(LogSettings::from_env(&StdEnvSource).level, "debug" | "trace")
}

/// Install a subscriber configured from the environment.
///
/// Does nothing unless `PRAX_DEBUG` or `PRAX_LOG_LEVEL` is set. Subsequent
/// calls are no-ops.
pub fn init() {
    let settings = LogSettings::from_env(&StdEnvSource);
    if settings.enabled {
        install(settings);
    }
}

/// Install a subscriber at the given level, ignoring `PRAX_DEBUG` and
/// `PRAX_LOG_LEVEL`.
pub fn init_with_level(level: &str) {
    let mut settings = LogSettings::from_env(&StdEnvSource);
    settings.level = parse_level(level).unwrap_or("warn");
    install(settings);
}

#[cfg(feature = "tracing-subscriber")]
fn install(settings: LogSettings) {
    INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter =
            EnvFilter::try_new(settings.directive()).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match settings.format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };

        if installed.is_ok() {
            tracing::info!(level = settings.level, format = ?settings.format, "Batch logging initialized");
        }
    });
}

#[cfg(not(feature = "tracing-subscriber"))]
fn install(_settings: LogSettings) {
    INIT.call_once(|| {});
}
