//! Logging setup for Lodestar.
//!
//! Structured logging is controlled through environment variables:
//!
//! - `LODESTAR_DEBUG=true|1|yes` - enable debug logging
//! - `LODESTAR_LOG_LEVEL=trace|debug|info|warn|error` - pick a level explicitly
//! - `LODESTAR_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! use lodestar_bson::logging;
//!
//! logging::init();
//! ```
//!
//! Library code uses the plain tracing macros:
//!
//! ```rust,ignore
//! debug!(type_name = %ty, "resolved serializer");
//! warn!(discriminator = %d, "unknown discriminator");
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "LODESTAR_DEBUG";
const LEVEL_VAR: &str = "LODESTAR_LOG_LEVEL";
const FORMAT_VAR: &str = "LODESTAR_LOG_FORMAT";

/// Returns `true` when `LODESTAR_DEBUG` is "true", "1" or "yes" (any case).
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// The configured log level.
///
/// Falls back to "debug" when debug logging is enabled and "warn" otherwise.
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var(LEVEL_VAR) {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// The configured log format, "json" unless overridden.
pub fn get_log_format() -> &'static str {
    env::var(FORMAT_VAR)
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Nothing is installed unless `LODESTAR_DEBUG` or `LODESTAR_LOG_LEVEL` is set,
/// so applications that bring their own subscriber are left alone.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var(LEVEL_VAR).is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = get_log_level();
            let filter = EnvFilter::try_new(format!(
                "lodestar={level},lodestar_bson={level},lodestar_linq={level},lodestar_driver={level}"
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            match get_log_format() {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "compact" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().compact())
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().pretty())
                        .init();
                }
            }

            tracing::info!(level = level, format = get_log_format(), "lodestar logging initialized");
        }
    });
}

/// Set `LODESTAR_LOG_LEVEL` and initialise logging.
///
/// # Safety
///
/// Modifies the process environment; call before spawning threads.
pub fn init_with_level(level: &str) {
    // SAFETY: documented as a startup-only call.
    unsafe {
        env::set_var(LEVEL_VAR, level);
    }
    init();
}

/// Enable debug logging and initialise.
///
/// # Safety
///
/// Modifies the process environment; call before spawning threads.
pub fn init_debug() {
    // SAFETY: documented as a startup-only call.
    unsafe {
        env::set_var(DEBUG_VAR, "true");
    }
    init();
}

/// Debug logging gated on `LODESTAR_DEBUG`.
#[macro_export]
macro_rules! lodestar_debug {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::debug!($($arg)*);
        }
    };
}

/// Trace logging gated on `LODESTAR_DEBUG`.
#[macro_export]
macro_rules! lodestar_trace {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::trace!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // SAFETY: the variables are only touched by this test.
        unsafe {
            env::remove_var(DEBUG_VAR);
            env::remove_var(LEVEL_VAR);
            env::remove_var(FORMAT_VAR);
        }
        assert!(!is_debug_enabled());
        assert_eq!(get_log_level(), "warn");
        assert_eq!(get_log_format(), "json");
    }
}
