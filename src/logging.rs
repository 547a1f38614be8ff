//! Subscriber setup for binaries and test harnesses.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "TEMPO_LOG";

static INIT: Once = Once::new();

/// Install a stderr `fmt` subscriber filtered by `TEMPO_LOG`.
///
/// Format: `TEMPO_LOG=tempo=debug,tempo::deliver=trace`. Falls back to
/// `tempo=info` when unset or unparsable. Safe to call more than once; a
/// subscriber installed by someone else is left in place.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("tempo=info"));

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .with(filter)
            .try_init();
    });
}
