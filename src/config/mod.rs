//! Configuration System
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `MICROSCAN_` (`__` separates key segments)
//! 2. TOML configuration file (default: `config/microscan.toml`)
//!
//! # Example
//!
//! ```no_run
//! use rust_microscan::config::ScopeConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScopeConfig::load_from("config/microscan.toml")?;
//!     println!("Settle time: {} ms", config.run.settle_time_ms);
//!     Ok(())
//! }
//! ```

pub mod scope_config;

pub use scope_config::{
    ApplicationConfig, ArrivalPolicy, AutofocusConfig, ConfigError, DetectionConfig, LogFormat,
    ObjectPolicy, RunConfig, ScopeConfig,
};
