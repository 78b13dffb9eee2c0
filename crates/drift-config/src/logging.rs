//! Structured logging utilities for drift components.
//!
//! Provides consistent logging with component prefixes and structured
//! fields.

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const RECOV: &'static str = "RECOV";
    pub const RPC: &'static str = "RPC";
    pub const STREAM: &'static str = "STREAM";
    pub const LFS: &'static str = "LFS";
    pub const DAEMON: &'static str = "DAEMON";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

// === RECOV logging macros ===

#[macro_export]
macro_rules! log_recov_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RECOV", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `DRIFT_LOG` overrides the level.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("DRIFT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::RECOV, "RECOV");
        assert_eq!(Component::RPC, "RPC");
        assert_eq!(Component::LFS, "LFS");
    }
}
