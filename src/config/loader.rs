//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. User config: `~/.config/promptguard/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Lists (domain sets) are **merged** (appended).
//! Scalars (ports, timeouts) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "promptguard";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to user configuration.
    user_path: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with a custom user config path (for testing).
    #[must_use]
    pub fn with_user_path(user_path: PathBuf) -> Self {
        Self { user_path }
    }

    /// Load and merge configuration from all sources.
    ///
    /// A missing user config is not an error; it is simply skipped. A missing
    /// `--config` file is an error (the user asked for it explicitly).
    /// Invalid TOML is always an error (fail fast with a clear message).
    pub fn load(&self, extra_config: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config: Config =
            toml::from_str(DEFAULT_CONFIG).map_err(|source| ConfigError::ParseError {
                path: PathBuf::from("<embedded default.toml>"),
                source,
            })?;
        debug!("Loaded embedded default configuration");

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(path) = extra_config {
            match self.load_file(path)? {
                Some(extra) => {
                    config.merge(extra);
                    debug!("Loaded additional config from {:?}", path);
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        Ok(config)
    }

    /// Load a single config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_embedded_defaults_only() {
        let loader = ConfigLoader::with_user_path(PathBuf::from("/nonexistent/config.toml"));
        let config = loader.load(None).unwrap();

        assert_ne!(config.supervisor.listen_port, 0);
        assert_ne!(config.supervisor.watchdog_interval_secs, 0);
    }

    #[test]
    fn test_user_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("config.toml");
        let mut f = fs::File::create(&user_path).unwrap();
        writeln!(f, "[supervisor]\nlisten_port = 28080\nworkspace = \"pilot\"").unwrap();

        let loader = ConfigLoader::with_user_path(user_path);
        let config = loader.load(None).unwrap();

        assert_eq!(config.supervisor.listen_port, 28080);
        assert_eq!(config.supervisor.workspace, "pilot");
    }

    #[test]
    fn test_extra_config_merges_lists() {
        let dir = tempfile::tempdir().unwrap();
        let extra_path = dir.path().join("extra.toml");
        let mut f = fs::File::create(&extra_path).unwrap();
        writeln!(f, "[network]\ninspect = [\"llm.corp.example\"]").unwrap();

        let loader = ConfigLoader::with_user_path(PathBuf::from("/nonexistent/config.toml"));
        let config = loader.load(Some(&extra_path)).unwrap();

        assert!(config
            .network
            .inspect
            .contains(&"llm.corp.example".to_string()));
    }

    #[test]
    fn test_missing_extra_config_is_error() {
        let loader = ConfigLoader::with_user_path(PathBuf::from("/nonexistent/config.toml"));
        let result = loader.load(Some(Path::new("/nonexistent/extra.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("config.toml");
        fs::write(&user_path, "this is not [valid toml").unwrap();

        let loader = ConfigLoader::with_user_path(user_path);
        let result = loader.load(None);
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }
}
