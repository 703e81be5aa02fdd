//! Parsing and validation of `kiln.toml` configuration files.
//!
//! This crate reads the memory layout constants (fixed base address, slot
//! count, code/data split) and cache settings, and resolves the
//! environment-style toggles (force-recompile, disable-cache, float-precision
//! override) that the calling layer may set on top of them.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, load_config_or_default, CONFIG_FILE};
pub use resolve::{resolve_toggles, resolve_toggles_from_env, CacheToggles};
pub use types::*;
