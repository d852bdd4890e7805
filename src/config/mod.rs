//! Configuration system for promptguard.
//!
//! This module provides TOML configuration loading with hierarchy merging for
//! the supervisor, the JSON workspace settings read from the external settings
//! store, and the environment-variable configuration handed to the
//! interception engine process.
//!
//! # Configuration Hierarchy
//!
//! 1. Embedded defaults (`config/default.toml`, compiled in)
//! 2. User config: `~/.config/promptguard/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (domain sets) are **merged** (appended)
//! - **Scalars** (ports, timeouts, urls) are **overridden**

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, EngineConfig, NetworkConfig, ProxySettings, SupervisorConfig, DEFAULT_LISTEN_PORT,
    DEFAULT_RISK_THRESHOLD,
};
