//! Configuration schema definitions.
//!
//! Three distinct configuration surfaces live here:
//!
//! - [`Config`]: the supervisor's TOML configuration, loaded from the embedded
//!   defaults and merged with user/CLI overrides.
//! - [`ProxySettings`]: the workspace enforcement settings owned by the external
//!   settings store. Read-only to this process, re-read on a fixed cadence so
//!   policy changes take effect without restarting the interception engine.
//! - [`EngineConfig`]: the interception engine's runtime configuration, which
//!   crosses the supervisor/engine process boundary exclusively through
//!   `PROMPTGUARD_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default local port the interception engine listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 18080;

/// Default risk threshold (sensitivity score) below which traffic is allowed.
pub const DEFAULT_RISK_THRESHOLD: u8 = 50;

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Supervisor and engine lifecycle settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Domain routing settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (domain sets) are merged (appended).
    /// Scalars (ports, timeouts, urls) are overridden when non-default.
    pub fn merge(&mut self, other: Config) {
        self.supervisor.merge(other.supervisor);
        self.network.merge(other.network);
    }
}

/// Supervisor lifecycle and engine settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Local port the interception engine listens on.
    #[serde(default)]
    pub listen_port: u16,

    /// Directory holding the persistent root CA material.
    ///
    /// Empty means `~/.promptguard/ca`.
    #[serde(default)]
    pub cert_dir: String,

    /// Workspace (tenant) identifier used for settings and activity records.
    #[serde(default)]
    pub workspace: String,

    /// Base URL of the external settings/activity store.
    #[serde(default)]
    pub store_url: String,

    /// Seconds to wait for the engine port to become reachable after spawn.
    #[serde(default)]
    pub startup_timeout_secs: u32,

    /// Watchdog liveness probe interval in seconds.
    #[serde(default)]
    pub watchdog_interval_secs: u32,

    /// Minimum seconds between repeated watchdog alerts.
    #[serde(default)]
    pub alert_cooldown_secs: u32,

    /// How often the engine re-reads workspace settings, in seconds.
    #[serde(default)]
    pub settings_refresh_secs: u32,
}

impl SupervisorConfig {
    fn merge(&mut self, other: SupervisorConfig) {
        if other.listen_port != 0 {
            self.listen_port = other.listen_port;
        }
        if !other.cert_dir.is_empty() {
            self.cert_dir = other.cert_dir;
        }
        if !other.workspace.is_empty() {
            self.workspace = other.workspace;
        }
        if !other.store_url.is_empty() {
            self.store_url = other.store_url;
        }
        if other.startup_timeout_secs != 0 {
            self.startup_timeout_secs = other.startup_timeout_secs;
        }
        if other.watchdog_interval_secs != 0 {
            self.watchdog_interval_secs = other.watchdog_interval_secs;
        }
        if other.alert_cooldown_secs != 0 {
            self.alert_cooldown_secs = other.alert_cooldown_secs;
        }
        if other.settings_refresh_secs != 0 {
            self.settings_refresh_secs = other.settings_refresh_secs;
        }
    }

    /// Resolve the certificate directory, defaulting under the home directory.
    pub fn resolved_cert_dir(&self) -> PathBuf {
        if !self.cert_dir.is_empty() {
            return PathBuf::from(&self.cert_dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".promptguard")
            .join("ca")
    }
}

/// Domain routing configuration.
///
/// Each list extends the corresponding built-in set in the domain router.
/// Inspection is allow-listed, not deny-listed: hosts matching none of the
/// sets default to passthrough so unknown traffic is never broken.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Additional hosts to inspect (decrypt, classify, enforce).
    ///
    /// Entries match the host exactly or any subdomain of it.
    #[serde(default)]
    pub inspect: Vec<String>,

    /// Additional cert-pinned hosts that break under interception.
    ///
    /// Inspected unless the workspace `desktop_bypass` setting is on.
    #[serde(default)]
    pub bypass: Vec<String>,

    /// Additional identity/infrastructure hosts that are never decrypted.
    #[serde(default)]
    pub passthrough: Vec<String>,
}

impl NetworkConfig {
    fn merge(&mut self, other: NetworkConfig) {
        self.inspect.extend(other.inspect);
        self.bypass.extend(other.bypass);
        self.passthrough.extend(other.passthrough);
    }
}

/// Workspace enforcement settings, owned by the external settings store.
///
/// The canonical field is `enforcement_mode`; `block_high_risk` and
/// `redact_sensitive` are legacy booleans kept for older workspaces and only
/// consulted when the canonical field is absent or invalid (see
/// [`crate::enforcement::resolve_enforcement_mode`]).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxySettings {
    /// Master switch: when false the engine passes all traffic through.
    #[serde(default = "default_true")]
    pub proxy_enabled: bool,

    /// Canonical enforcement mode: monitor, warn, redact, or block.
    #[serde(default)]
    pub enforcement_mode: Option<String>,

    /// Legacy: block critical-tier traffic.
    #[serde(default)]
    pub block_high_risk: Option<bool>,

    /// Legacy: redact sensitive spans instead of blocking.
    #[serde(default)]
    pub redact_sensitive: Option<bool>,

    /// When on, cert-pinned desktop hosts are tunneled instead of inspected.
    #[serde(default)]
    pub desktop_bypass: bool,

    /// When on, multipart file uploads are scanned per-file.
    #[serde(default)]
    pub inspect_attachments: bool,

    /// When on, raw request content is retained on activity events
    /// instead of one-way hashes.
    #[serde(default)]
    pub full_audit_mode: bool,

    /// Sensitivity score below which traffic is always allowed.
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: u8,
}

fn default_true() -> bool {
    true
}

fn default_risk_threshold() -> u8 {
    DEFAULT_RISK_THRESHOLD
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            proxy_enabled: true,
            enforcement_mode: None,
            block_high_risk: None,
            redact_sensitive: None,
            desktop_bypass: false,
            inspect_attachments: false,
            full_audit_mode: false,
            risk_threshold: DEFAULT_RISK_THRESHOLD,
        }
    }
}

/// Interception engine runtime configuration.
///
/// The supervisor spawns the engine as an independent OS process; this struct
/// is the only thing that crosses that boundary, serialized as environment
/// variables. There is no shared memory between the two processes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local port to listen on for CONNECT-style proxy traffic.
    pub listen_port: u16,
    /// Directory holding the persistent root CA material.
    pub cert_dir: PathBuf,
    /// Workspace (tenant) identifier.
    pub workspace: String,
    /// Base URL of the external settings/activity store.
    pub store_url: String,
    /// How often workspace settings are re-read.
    pub settings_refresh: Duration,
    /// Initial enforcement mode until the first settings read succeeds.
    pub enforcement_mode: Option<String>,
    /// Initial attachment-inspection flag until the first settings read.
    pub inspect_attachments: bool,
    /// Extra inspect-set entries from supervisor config.
    pub extra_inspect: Vec<String>,
    /// Extra bypass-set entries from supervisor config.
    pub extra_bypass: Vec<String>,
    /// Extra passthrough-set entries from supervisor config.
    pub extra_passthrough: Vec<String>,
}

/// Environment variable names for the engine process.
mod env_keys {
    pub const PORT: &str = "PROMPTGUARD_PORT";
    pub const CERT_DIR: &str = "PROMPTGUARD_CERT_DIR";
    pub const WORKSPACE: &str = "PROMPTGUARD_WORKSPACE";
    pub const STORE_URL: &str = "PROMPTGUARD_STORE_URL";
    pub const SETTINGS_REFRESH_SECS: &str = "PROMPTGUARD_SETTINGS_REFRESH_SECS";
    pub const ENFORCEMENT_MODE: &str = "PROMPTGUARD_ENFORCEMENT_MODE";
    pub const INSPECT_ATTACHMENTS: &str = "PROMPTGUARD_INSPECT_ATTACHMENTS";
    pub const EXTRA_INSPECT: &str = "PROMPTGUARD_EXTRA_INSPECT";
    pub const EXTRA_BYPASS: &str = "PROMPTGUARD_EXTRA_BYPASS";
    pub const EXTRA_PASSTHROUGH: &str = "PROMPTGUARD_EXTRA_PASSTHROUGH";
}

impl EngineConfig {
    /// Build an engine config from the supervisor's merged configuration.
    pub fn from_supervisor(config: &Config) -> Self {
        let sup = &config.supervisor;
        Self {
            listen_port: if sup.listen_port != 0 {
                sup.listen_port
            } else {
                DEFAULT_LISTEN_PORT
            },
            cert_dir: sup.resolved_cert_dir(),
            workspace: if sup.workspace.is_empty() {
                "default".to_string()
            } else {
                sup.workspace.clone()
            },
            store_url: sup.store_url.clone(),
            settings_refresh: Duration::from_secs(if sup.settings_refresh_secs != 0 {
                sup.settings_refresh_secs as u64
            } else {
                15
            }),
            enforcement_mode: None,
            inspect_attachments: false,
            extra_inspect: config.network.inspect.clone(),
            extra_bypass: config.network.bypass.clone(),
            extra_passthrough: config.network.passthrough.clone(),
        }
    }

    /// Read the engine config from the process environment.
    ///
    /// Used by the hidden `internal-engine` subcommand. Missing variables fall
    /// back to defaults so a manually launched engine still runs.
    pub fn from_env() -> Self {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let get_list = |key: &str| -> Vec<String> {
            get(key)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            listen_port: get(env_keys::PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_LISTEN_PORT),
            cert_dir: get(env_keys::CERT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| SupervisorConfig::default().resolved_cert_dir()),
            workspace: get(env_keys::WORKSPACE).unwrap_or_else(|| "default".to_string()),
            store_url: get(env_keys::STORE_URL).unwrap_or_default(),
            settings_refresh: Duration::from_secs(
                get(env_keys::SETTINGS_REFRESH_SECS)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            ),
            enforcement_mode: get(env_keys::ENFORCEMENT_MODE),
            inspect_attachments: get(env_keys::INSPECT_ATTACHMENTS)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            extra_inspect: get_list(env_keys::EXTRA_INSPECT),
            extra_bypass: get_list(env_keys::EXTRA_BYPASS),
            extra_passthrough: get_list(env_keys::EXTRA_PASSTHROUGH),
        }
    }

    /// Serialize this config as environment variables for the engine process.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (env_keys::PORT.into(), self.listen_port.to_string()),
            (
                env_keys::CERT_DIR.into(),
                self.cert_dir.display().to_string(),
            ),
            (env_keys::WORKSPACE.into(), self.workspace.clone()),
            (env_keys::STORE_URL.into(), self.store_url.clone()),
            (
                env_keys::SETTINGS_REFRESH_SECS.into(),
                self.settings_refresh.as_secs().to_string(),
            ),
            (
                env_keys::INSPECT_ATTACHMENTS.into(),
                if self.inspect_attachments { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(ref mode) = self.enforcement_mode {
            env.push((env_keys::ENFORCEMENT_MODE.into(), mode.clone()));
        }
        if !self.extra_inspect.is_empty() {
            env.push((env_keys::EXTRA_INSPECT.into(), self.extra_inspect.join(",")));
        }
        if !self.extra_bypass.is_empty() {
            env.push((env_keys::EXTRA_BYPASS.into(), self.extra_bypass.join(",")));
        }
        if !self.extra_passthrough.is_empty() {
            env.push((
                env_keys::EXTRA_PASSTHROUGH.into(),
                self.extra_passthrough.join(","),
            ));
        }
        env
    }

    /// Initial settings snapshot used until the first store read succeeds.
    pub fn initial_settings(&self) -> ProxySettings {
        ProxySettings {
            enforcement_mode: self.enforcement_mode.clone(),
            inspect_attachments: self.inspect_attachments,
            ..ProxySettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_empty() {
        let config = Config::default();
        assert_eq!(config.supervisor.listen_port, 0);
        assert!(config.network.inspect.is_empty());
        assert!(config.network.passthrough.is_empty());
    }

    #[test]
    fn test_config_merge_scalars() {
        let mut base = Config::default();
        let override_config = Config {
            supervisor: SupervisorConfig {
                listen_port: 9999,
                workspace: "acme".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(override_config);

        assert_eq!(base.supervisor.listen_port, 9999);
        assert_eq!(base.supervisor.workspace, "acme");
    }

    #[test]
    fn test_config_merge_lists() {
        let mut base = Config {
            network: NetworkConfig {
                inspect: vec!["ai.example.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(Config {
            network: NetworkConfig {
                inspect: vec!["llm.example.org".to_string()],
                passthrough: vec!["sso.example.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(base.network.inspect.len(), 2);
        assert!(base
            .network
            .passthrough
            .contains(&"sso.example.com".to_string()));
    }

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
            [supervisor]
            listen_port = 18080
            workspace = "pilot"
            watchdog_interval_secs = 5

            [network]
            inspect = ["ai.internal.example"]
            passthrough = ["login.internal.example"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();

        assert_eq!(config.supervisor.listen_port, 18080);
        assert_eq!(config.supervisor.workspace, "pilot");
        assert_eq!(config.supervisor.watchdog_interval_secs, 5);
        assert!(config
            .network
            .inspect
            .contains(&"ai.internal.example".to_string()));
    }

    #[test]
    fn test_proxy_settings_defaults() {
        let settings: ProxySettings = serde_json::from_str("{}").unwrap();
        assert!(settings.proxy_enabled);
        assert_eq!(settings.risk_threshold, DEFAULT_RISK_THRESHOLD);
        assert!(settings.enforcement_mode.is_none());
        assert!(!settings.full_audit_mode);
    }

    #[test]
    fn test_proxy_settings_deserialize_legacy_fields() {
        let json = r#"{"proxy_enabled": true, "block_high_risk": true, "risk_threshold": 70}"#;
        let settings: ProxySettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.block_high_risk, Some(true));
        assert_eq!(settings.risk_threshold, 70);
    }

    #[test]
    fn test_engine_config_env_round_trip() {
        let config = EngineConfig {
            listen_port: 12345,
            cert_dir: PathBuf::from("/tmp/pg-ca"),
            workspace: "acme".to_string(),
            store_url: "http://127.0.0.1:8787".to_string(),
            settings_refresh: Duration::from_secs(30),
            enforcement_mode: Some("block".to_string()),
            inspect_attachments: true,
            extra_inspect: vec!["ai.corp.example".to_string()],
            extra_bypass: vec![],
            extra_passthrough: vec!["sso.corp.example".to_string()],
        };

        let env = config.to_env();
        let lookup = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        assert_eq!(lookup("PROMPTGUARD_PORT"), Some("12345".to_string()));
        assert_eq!(lookup("PROMPTGUARD_WORKSPACE"), Some("acme".to_string()));
        assert_eq!(
            lookup("PROMPTGUARD_ENFORCEMENT_MODE"),
            Some("block".to_string())
        );
        assert_eq!(
            lookup("PROMPTGUARD_EXTRA_INSPECT"),
            Some("ai.corp.example".to_string())
        );
        assert_eq!(
            lookup("PROMPTGUARD_INSPECT_ATTACHMENTS"),
            Some("1".to_string())
        );
    }

    #[test]
    fn test_initial_settings_seed_from_engine_config() {
        let config = EngineConfig {
            listen_port: 1,
            cert_dir: PathBuf::new(),
            workspace: String::new(),
            store_url: String::new(),
            settings_refresh: Duration::from_secs(15),
            enforcement_mode: Some("monitor".to_string()),
            inspect_attachments: true,
            extra_inspect: vec![],
            extra_bypass: vec![],
            extra_passthrough: vec![],
        };

        let settings = config.initial_settings();
        assert_eq!(settings.enforcement_mode, Some("monitor".to_string()));
        assert!(settings.inspect_attachments);
        assert!(settings.proxy_enabled);
    }

    #[test]
    fn test_resolved_cert_dir_explicit() {
        let sup = SupervisorConfig {
            cert_dir: "/var/lib/promptguard/ca".to_string(),
            ..Default::default()
        };
        assert_eq!(
            sup.resolved_cert_dir(),
            PathBuf::from("/var/lib/promptguard/ca")
        );
    }

    #[test]
    fn test_default_toml_parses() {
        let toml_content = include_str!("../../config/default.toml");
        let config: Config =
            toml::from_str(toml_content).expect("default.toml should parse as Config");

        assert_eq!(config.supervisor.listen_port, DEFAULT_LISTEN_PORT);
        assert_ne!(config.supervisor.watchdog_interval_secs, 0);
        assert_ne!(config.supervisor.startup_timeout_secs, 0);
    }
}
