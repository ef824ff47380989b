use std::sync::Arc;
use std::time::Duration;

use driftfix_common::{Error, Result};
use driftfix_config::AppConfig;
use driftfix_db::{SiteDatabase, SiteStore, StoreOptions};
use driftfix_migrate::{Runner, RunnerOptions, SchemaVersion};
use driftfix_security::{AdminDirectory, Capability, NonceIssuer};
use driftfix_steps::{DisabledGeocoder, Geocoder, NominatimGeocoder, StepContext, gatherpress_registry};
use tracing::{info, warn};

/// Shared application state accessible from all request handlers.
pub struct AppState {
    pub config: AppConfig,
    pub database: SiteDatabase,
    /// Read-only handle on the same file for status requests.
    pub inspect: SiteDatabase,
    pub runner: Runner<SiteStore>,
    pub admins: AdminDirectory,
    pub nonces: NonceIssuer,
    pub companion_version: Option<SchemaVersion>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let database = open_database(&config)?;
        let inspect = open_database_readonly(&config)?;
        let runner = build_runner(&config)?;
        let nonces = nonce_issuer(&config)?;

        let mut admins = AdminDirectory::new()?;
        for (name, admin) in &config.security.admins {
            let capabilities = admin
                .capabilities
                .iter()
                .map(|c| c.parse::<Capability>())
                .collect::<Result<Vec<_>>>()?;
            admins.add(name.clone(), &admin.api_key, capabilities)?;
        }
        if admins.is_empty() {
            warn!("no admins configured; every migration request will be refused");
        }

        let companion_version = companion_version(&config);

        Ok(Self {
            config,
            database,
            inspect,
            runner,
            admins,
            nonces,
            companion_version,
        })
    }
}

pub type SharedState = Arc<AppState>;

fn configured_database(config: &AppConfig, read_only: bool) -> Result<SiteDatabase> {
    let path = config
        .database
        .path
        .clone()
        .ok_or_else(|| Error::Config("database.path is not set".into()))?;
    let options = StoreOptions {
        busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
        lock_stale_after: Duration::from_secs(config.migrate.lock_stale_secs),
        read_only,
    };

    SiteDatabase::new(
        path,
        config.database.base_prefix.clone(),
        config.database.multisite,
        options,
    )
}

/// Open (and install if needed) the configured site database.
pub fn open_database(config: &AppConfig) -> Result<SiteDatabase> {
    let database = configured_database(config, false)?;
    database.install()?;
    Ok(database)
}

/// Open the configured site database for inspection. Nothing is created or
/// installed; a missing file is `Error::NotFound`.
pub fn open_database_readonly(config: &AppConfig) -> Result<SiteDatabase> {
    let database = configured_database(config, true)?;
    if !database.path().is_file() {
        return Err(Error::NotFound(format!(
            "site database {} (run `driftfix migrate` to create it)",
            database.path().display()
        )));
    }
    Ok(database)
}

/// The GatherPress registry wired to the configured geocoder.
pub fn build_runner(config: &AppConfig) -> Result<Runner<SiteStore>> {
    let geocoder: Arc<dyn Geocoder> = if config.geocoder.enabled {
        Arc::new(
            NominatimGeocoder::new(
                &config.geocoder.base_url,
                Duration::from_secs(config.geocoder.timeout_secs),
                config.geocoder.user_agent.clone(),
            )
            .with_min_interval(Duration::from_millis(config.geocoder.min_interval_ms)),
        )
    } else {
        info!("geocoding disabled; venue coordinates will not be backfilled");
        Arc::new(DisabledGeocoder)
    };

    let ctx = StepContext {
        batch_size: config.migrate.batch_size,
        geocoder,
    };
    let registry = gatherpress_registry(&ctx).map_err(|e| Error::Migration(e.to_string()))?;

    Ok(Runner::new(
        Arc::new(registry),
        RunnerOptions {
            lock_timeout: Duration::from_secs(config.migrate.lock_timeout_secs),
            ..RunnerOptions::default()
        },
    ))
}

pub fn nonce_issuer(config: &AppConfig) -> Result<NonceIssuer> {
    let secret = config
        .security
        .nonce_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::Config("security.nonce_secret (or DRIFTFIX_NONCE_SECRET) is required".into())
        })?;
    NonceIssuer::new(
        secret.as_bytes(),
        Duration::from_secs(config.security.nonce_ttl_secs),
    )
}

/// The configured companion version; an unparsable value is logged and
/// ignored.
pub fn companion_version(config: &AppConfig) -> Option<SchemaVersion> {
    let raw = config.companion_version.as_deref()?;
    match raw.parse() {
        Ok(version) => Some(version),
        Err(e) => {
            warn!("ignoring companion_version {raw:?}: {e}");
            None
        }
    }
}
