//! Module-gated logging for the trip engine.
//!
//! Each module that logs declares `const ENABLE_LOGS: bool` next to its imports; setting it
//! to `false` silences that module (for example the per-report chatter of the monitor loop
//! during a long replay) without touching the `RUST_LOG` filter of everything else.
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info};
//!
//! log_info!("Trip {} completed", trip.id);
//! log_debug!("Mode {} -> {}", previous.as_str(), next.as_str());
//! ```

/// Shared body of the level macros. Not meant to be called directly.
#[doc(hidden)]
#[macro_export]
macro_rules! __gated_log {
    ($level:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::log!($level, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::__gated_log!(log::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::__gated_log!(log::Level::Warn, $($arg)*)
    };
}

/// Failed writes and lost deadlines.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::__gated_log!(log::Level::Error, $($arg)*)
    };
}

/// Per-event noise such as location ticks and individual reports.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::__gated_log!(log::Level::Debug, $($arg)*)
    };
}
