use anyhow::{Context, Result, bail};
use driftfix_config::AppConfig;
use driftfix_db::SiteDatabase;
use driftfix_gateway::{
    GatewayServer, build_runner, companion_version, nonce_issuer, open_database,
    open_database_readonly,
};
use driftfix_migrate::{NetworkReport, Notice, ScopeProvider, ScopeStatus, collect_notices};
use driftfix_security::{InputValidator, MIGRATE_ACTION};
use serde_json::json;
use tracing::info;

use crate::banner;

fn database(config: &AppConfig) -> Result<SiteDatabase> {
    open_database(config).context("failed to open site database")
}

pub fn migrate(config: &AppConfig, site: Option<&str>, parallel: bool) -> Result<()> {
    let database = database(config)?;
    let runner = build_runner(config).context("failed to build migration registry")?;

    let report = match site {
        Some(id) => {
            InputValidator::validate_scope_id(id)?;
            let scope = database.find_scope(id)?;
            runner.run_scopes(&database, &[scope])
        }
        None if parallel => runner.run_network_parallel(&database)?,
        None => runner.run_network(&database)?,
    };

    print_report(&report);
    let failed = report.failed().count();
    if failed > 0 {
        bail!(
            "{failed} of {} site(s) failed to migrate; fix the cause and run again to resume",
            report.outcomes.len()
        );
    }
    Ok(())
}

fn print_report(report: &NetworkReport) {
    for outcome in &report.outcomes {
        let id = &outcome.scope.id;
        match &outcome.result {
            Ok(run) if run.is_noop() => println!("site {id}: up to date at {}", run.to),
            Ok(run) => {
                println!("site {id}: {} -> {}", run.from, run.to);
                for step in &run.applied {
                    println!(
                        "  applied {} ({}) in {} ms",
                        step.name, step.version, step.elapsed_ms
                    );
                }
            }
            Err(e) => eprintln!("site {id}: {e}"),
        }
    }
}

pub fn status(config: &AppConfig, as_json: bool) -> Result<()> {
    let database = open_database_readonly(config).context("failed to open site database")?;
    let runner = build_runner(config).context("failed to build migration registry")?;

    let notices = collect_notices(&runner, &database, companion_version(config).as_ref())?;
    let mut statuses = Vec::new();
    for scope in database.scopes()? {
        let store = database.open(&scope)?;
        statuses.push(runner.status(&scope, &store)?);
    }

    if as_json {
        let body = json!({ "notices": notices, "scopes": statuses });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        print_status(&statuses, &notices);
    }
    Ok(())
}

fn print_status(statuses: &[ScopeStatus], notices: &[Notice]) {
    for status in statuses {
        let applied = status
            .applied
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        let locked = if status.locked { ", locked" } else { "" };
        println!(
            "site {} ({}): applied {applied}{locked}",
            status.scope.id, status.scope.table_prefix
        );
        if status.is_up_to_date() {
            println!("  up to date");
        }
        for step in &status.pending {
            println!("  pending {} ({})", step.name, step.version);
        }
    }
    for notice in notices {
        println!("notice: {notice}");
    }
}

pub fn run_step(config: &AppConfig, name: &str, site: Option<&str>) -> Result<()> {
    let database = database(config)?;
    let runner = build_runner(config).context("failed to build migration registry")?;

    let scope = match site {
        Some(id) => {
            InputValidator::validate_scope_id(id)?;
            database.find_scope(id)?
        }
        None => database.scope_for(1),
    };
    let store = database.open(&scope)?;
    let applied = runner
        .run_step(&scope, &store, name)
        .with_context(|| format!("step {name} failed on site {}", scope.id))?;

    println!(
        "site {}: ran {} ({}) in {} ms; applied version unchanged",
        scope.id, applied.name, applied.version, applied.elapsed_ms
    );
    Ok(())
}

pub fn uninstall(config: &AppConfig) -> Result<()> {
    let database = database(config)?;
    let runner = build_runner(config).context("failed to build migration registry")?;

    for scope in database.scopes()? {
        let store = database.open(&scope)?;
        runner
            .reset(&scope, &store)
            .with_context(|| format!("failed to reset site {}", scope.id))?;
        println!("site {}: applied version cleared", scope.id);
    }
    Ok(())
}

pub fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    {
        let runner = build_runner(&config).context("failed to build migration registry")?;
        let registry = runner.registry();
        let latest = registry
            .latest_version()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        banner::print_banner(
            &config.gateway.host,
            config.gateway.port,
            &config,
            registry.len(),
            &latest,
        );
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime
        .block_on(GatewayServer::new(config).run())
        .context("gateway stopped")?;
    info!("gateway shut down");
    Ok(())
}

pub fn issue_nonce(config: &AppConfig, user: &str) -> Result<()> {
    InputValidator::validate_user_name(user)?;
    let issuer = nonce_issuer(config).context("cannot issue nonces")?;
    println!("{}", issuer.issue(MIGRATE_ACTION, user));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.path = Some(dir.path().join("site.db"));
        config.geocoder.enabled = false;
        config.security.nonce_secret = Some("cli-secret".to_string());
        config
    }

    fn applied(config: &AppConfig) -> Option<String> {
        let database = open_database(config).unwrap();
        let runner = build_runner(config).unwrap();
        let scope = database.scope_for(1);
        let store = database.open(&scope).unwrap();
        runner
            .status(&scope, &store)
            .unwrap()
            .applied
            .map(|v| v.to_string())
    }

    #[test]
    fn migrate_then_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        migrate(&config, None, false).unwrap();
        assert_eq!(applied(&config).as_deref(), Some("0.33.0"));
        migrate(&config, Some("1"), false).unwrap();

        uninstall(&config).unwrap();
        assert_eq!(applied(&config), None);
    }

    #[test]
    fn migrate_rejects_unknown_sites() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        assert!(migrate(&config, Some("12"), false).is_err());
        assert!(migrate(&config, Some("x"), false).is_err());
    }

    #[test]
    fn run_step_leaves_the_applied_version_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        run_step(&config, "rename-css-classes", None).unwrap();
        assert_eq!(applied(&config), None);
        assert!(run_step(&config, "no-such-step", None).is_err());
    }

    #[test]
    fn status_never_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        open_database(&config).unwrap();

        status(&config, true).unwrap();
        status(&config, false).unwrap();
        assert_eq!(applied(&config), None);
    }

    #[test]
    fn status_on_a_fresh_path_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let path = dir.path().join("site.db");

        assert!(status(&config, false).is_err());
        assert!(!path.exists());

        // An empty file is a valid database with no tables; it must stay empty.
        std::fs::write(&path, b"").unwrap();
        assert!(status(&config, true).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn issue_nonce_needs_a_secret_and_a_valid_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        issue_nonce(&config, "alice").unwrap();
        assert!(issue_nonce(&config, "a|b").is_err());
        config.security.nonce_secret = None;
        assert!(issue_nonce(&config, "alice").is_err());
    }
}
