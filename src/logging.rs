//! # Logging module
//!
//! This module provides logging facilities and helpers. The `-v` verbosity
//! sets the default filter, a `RUST_LOG` environment variable replaces it.

use tracing::Level;
use tracing_subscriber::EnvFilter;

// -----------------------------------------------------------------------------
// Constants

pub const CRATE: &str = env!("CARGO_CRATE_NAME");

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// returns the default filter directives, the operator logs at the level
/// given by the verbosity while dependencies (kube, hyper, aws sdk) stay at
/// warning until the most verbose level
pub fn directives(verbosity: usize) -> String {
    let dependencies = match verbosity {
        0 => Level::ERROR,
        1..=3 => Level::WARN,
        _ => Level::TRACE,
    };

    format!("{dependencies},{CRATE}={}", level(verbosity))
}

pub fn initialize(verbosity: usize) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(verbosity)));

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}
