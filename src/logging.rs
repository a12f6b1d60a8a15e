//! Tracing initialization.
//!
//! `RUST_LOG` takes precedence when set; otherwise the configured level applies to
//! this crate and `warn` to everything else.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ApplicationConfig, LogFormat};

/// Install the global subscriber described by `config`.
///
/// Returns `false` if a subscriber was already installed (tests, embedding hosts);
/// that is not an error.
pub fn init(config: &ApplicationConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,rust_microscan={}", config.log_level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = ApplicationConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
