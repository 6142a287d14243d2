//! Logging utilities and structured logging support

use std::sync::Once;

pub use log::{debug, error, info, trace, warn};

/// Logger configuration.
///
/// `filter` follows the `env_logger` filter syntax (e.g. "info",
/// "shiny_guacamole=debug"). When unset, `RUST_LOG` is honoured and the
/// fallback level is `info`.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Explicit filter overriding `RUST_LOG`
    pub filter: Option<String>,
}

static INIT: Once = Once::new();

/// Initialize the logging system with default settings
pub fn init() {
    init_with(&LoggingConfig::default());
}

/// Initialize the logging system once; later calls are ignored.
pub fn init_with(config: &LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        match config.filter.clone().or_else(|| std::env::var("RUST_LOG").ok()) {
            Some(filter) => {
                builder.parse_filters(&filter);
            }
            None => {
                builder.filter_level(log::LevelFilter::Info);
            }
        }

        // Tests and embedding hosts may have installed a logger already.
        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
}
