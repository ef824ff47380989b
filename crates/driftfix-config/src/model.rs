use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, usually read from `~/.driftfix/config.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrate: MigrateConfig,
    pub geocoder: GeocoderConfig,
    pub gateway: GatewayConfig,
    pub security: SecurityConfig,
    /// Installed GatherPress version, used for the version mismatch notice.
    pub companion_version: Option<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    pub base_prefix: String,
    pub multisite: bool,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            base_prefix: "wp_".to_string(),
            multisite: false,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// How long a run waits for another run on the same scope to finish.
    pub lock_timeout_secs: u64,
    /// Locks older than this are treated as abandoned.
    pub lock_stale_secs: u64,
    pub batch_size: usize,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 60,
            lock_stale_secs: 15 * 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Minimum spacing between two lookups, in milliseconds.
    pub min_interval_ms: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            timeout_secs: 10,
            user_agent: format!("driftfix/{}", env!("CARGO_PKG_VERSION")),
            min_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3899,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HMAC key for action nonces. Required by `serve`.
    pub nonce_secret: Option<String>,
    pub nonce_ttl_secs: u64,
    pub admins: HashMap<String, AdminConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            nonce_secret: None,
            nonce_ttl_secs: 12 * 60 * 60,
            admins: HashMap::new(),
        }
    }
}

/// An operator allowed to call the HTTP trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    pub api_key: String,
    /// Capability names, e.g. `manage_options`, `manage_network`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_single_site_install() {
        let config = AppConfig::default();
        assert_eq!(config.database.base_prefix, "wp_");
        assert!(!config.database.multisite);
        assert_eq!(config.migrate.batch_size, 100);
        assert_eq!(config.migrate.lock_timeout_secs, 60);
        assert!(config.geocoder.enabled);
        assert_eq!(config.geocoder.min_interval_ms, 1000);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let yaml = "database:\n  multisite: true\nsecurity:\n  admins:\n    ops:\n      api_key: k1\n      capabilities: [manage_network]\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.database.multisite);
        assert_eq!(config.database.base_prefix, "wp_");
        assert_eq!(config.gateway.port, 3899);
        let ops = &config.security.admins["ops"];
        assert_eq!(ops.api_key, "k1");
        assert_eq!(ops.capabilities, vec!["manage_network".to_string()]);
    }
}
