// src/logging.rs

//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a stderr `tracing` subscriber.
///
/// `verbosity` maps 0..=4 to error, warn, info, debug and trace for this
/// crate. `RUST_LOG` overrides it when set. Returns `false` if a global
/// subscriber was already installed.
pub fn init_logging(verbosity: u8) -> bool {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("http_transfers={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .is_ok()
}
