//! Zero-cost tracing helpers.
//!
//! All logging funnels through one forwarding macro, `log_at!`, which
//! expands to the matching `tracing` macro when the `tracing` feature is
//! enabled and to nothing otherwise. The per-level macros the rest of the
//! crate calls are thin wrappers over it.
//!
//! ```bash
//! # Normal build - no tracing overhead
//! cargo build --release
//!
//! # Run a test with structured logs
//! RUST_LOG=pmindex=debug cargo test --features tracing rebuild
//! ```

/// Forward to `tracing` at the given level. Compiles to a no-op without
/// the `tracing` feature; arguments are not evaluated.
#[cfg(feature = "tracing")]
macro_rules! log_at {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_at {
    ($level:ident, $($arg:tt)*) => {};
}

/// Debug-level logging: allocator growth, rebuild progress.
macro_rules! debug_log {
    ($($arg:tt)*) => {
        crate::tracing_helpers::log_at!(debug, $($arg)*)
    };
}

/// Warn-level logging: recoverable but unexpected conditions, like a hash
/// bucket chain outgrowing its first-level block.
macro_rules! warn_log {
    ($($arg:tt)*) => {
        crate::tracing_helpers::log_at!(warn, $($arg)*)
    };
}

/// Error-level logging: fatal conditions reported just before a
/// `Corruption` status.
macro_rules! error_log {
    ($($arg:tt)*) => {
        crate::tracing_helpers::log_at!(error, $($arg)*)
    };
}

pub(crate) use {debug_log, error_log, log_at, warn_log};
