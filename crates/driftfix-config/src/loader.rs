use std::path::{Path, PathBuf};

use driftfix_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

/// Locates and parses the configuration file, then layers environment
/// overrides on top.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// `~/.driftfix`, falling back to the working directory when no home
    /// directory is known.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".driftfix")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load the first config file found in the config directory. A missing
    /// file is not an error: defaults plus environment overrides are used.
    pub fn load(&self) -> Result<AppConfig> {
        // .env next to the config takes effect before overrides are read
        let _ = dotenvy::from_path(self.config_dir.join(".env"));

        let found = CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|path| path.is_file());

        let mut config = match found {
            Some(path) => Self::parse_file(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config);
        if config.database.path.is_none() {
            config.database.path = Some(self.config_dir.join("data").join("site.db"));
        }
        validate(&config)?;
        Ok(config)
    }

    /// Load an explicit file (e.g. `--config`), with environment overrides.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let mut config = Self::parse_file(path)?;
        apply_env_overrides(&mut config);
        if config.database.path.is_none() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            config.database.path = Some(dir.join("data").join("site.db"));
        }
        validate(&config)?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("config loaded from {}", path.display());
        Ok(config)
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(path) = std::env::var("DRIFTFIX_DB_PATH")
        && !path.is_empty()
    {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Ok(secret) = std::env::var("DRIFTFIX_NONCE_SECRET")
        && !secret.is_empty()
    {
        config.security.nonce_secret = Some(secret);
    }
    if let Ok(url) = std::env::var("DRIFTFIX_GEOCODER_URL")
        && !url.is_empty()
    {
        config.geocoder.base_url = url;
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.migrate.batch_size == 0 {
        return Err(Error::Config("migrate.batch_size must be positive".into()));
    }
    let prefix = &config.database.base_prefix;
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "database.base_prefix must be non-empty [A-Za-z0-9_]: {prefix:?}"
        )));
    }
    url::Url::parse(&config.geocoder.base_url)
        .map_err(|e| Error::Config(format!("invalid geocoder.base_url: {e}")))?;
    for (name, admin) in &config.security.admins {
        if admin.api_key.is_empty() {
            return Err(Error::Config(format!("admin {name} has an empty api_key")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults_with_db_under_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new(dir.path()).load().unwrap();
        assert_eq!(
            config.database.path.as_deref(),
            Some(dir.path().join("data").join("site.db").as_path())
        );
        assert_eq!(config.database.base_prefix, "wp_");
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "companion_version = \"0.33.0\"\n[migrate]\nbatch_size = 25\n",
        )
        .unwrap();
        let config = ConfigLoader::new(dir.path()).load().unwrap();
        assert_eq!(config.migrate.batch_size, 25);
        assert_eq!(config.companion_version.as_deref(), Some("0.33.0"));
    }

    #[test]
    fn rejects_unsafe_table_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "database:\n  base_prefix: \"wp_; DROP\"\n").unwrap();
        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("base_prefix"));
    }

    #[test]
    fn explicit_file_puts_default_db_next_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.yml");
        std::fs::write(&path, "database:\n  multisite: true\n").unwrap();
        let config = ConfigLoader::load_from(&path).unwrap();
        assert!(config.database.multisite);
        assert_eq!(
            config.database.path.as_deref(),
            Some(dir.path().join("data").join("site.db").as_path())
        );
    }

    #[test]
    fn rejects_zero_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "migrate:\n  batch_size: 0\n").unwrap();
        assert!(ConfigLoader::load_from(&path).is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }
}
