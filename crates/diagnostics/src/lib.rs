// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging setup shared by every crate in the visor workspace.
//!
//! Verbosity comes from the `VISOR_LOG` environment variable:
//! - `off` (default): nothing is emitted
//! - `error`, `warn`, `info`, `debug`: minimum level written to stderr
//!
//! Library crates only use the macros below; binaries call [`init`] once.

use std::sync::Once;

// Re-export emit so the macros resolve from any crate
pub use emit;

/// Environment variable consulted by [`init`].
pub const LOG_ENV: &str = "VISOR_LOG";

static INIT: Once = Once::new();

/// Parse a `VISOR_LOG` value. `None` means logging is disabled.
///
/// Unknown values fall back to `info`.
pub fn parse_level(value: &str) -> Option<emit::Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" | "none" => None,
        "error" => Some(emit::Level::Error),
        "warn" | "warning" => Some(emit::Level::Warn),
        "debug" | "trace" => Some(emit::Level::Debug),
        _ => Some(emit::Level::Info),
    }
}

/// Initialize the emit runtime from `VISOR_LOG`.
///
/// Safe to call more than once; only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let value = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
        let Some(level) = parse_level(&value) else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime lives for the rest of the process.
        std::mem::forget(rt);
    });
}

/// Operations a user wants to see: acquisitions, cache placement, job results.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Step-by-step detail: cache hits, generated SQL, progress reports.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Recoverable problems: failed cache writes, skipped indexes, fallbacks.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Failures that end an operation, such as a failed download job.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}
