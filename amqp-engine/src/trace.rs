//! Logging for the engine.
//!
//! Enable with `--features tracing`. Without the feature every macro below
//! expands to nothing, so frame dispatch pays nothing for its log lines.

/// Installs a tracing subscriber with thread names and uptime timestamps.
///
/// The filter defaults to `amqp_engine=trace` and can be overridden through
/// `RUST_LOG`. Call once, at the start of the server binary or a test.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amqp_engine=trace"));

    // A second call (e.g. from another test) finds a subscriber already set.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

/// Swallows a log invocation when the `tracing` feature is off.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
