mod banner;
mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use driftfix_config::{AppConfig, ConfigLoader, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driftfix", version, about = "Versioned data repair for GatherPress sites")]
struct Cli {
    /// Config file (default: ~/.driftfix/config.yml)
    #[arg(long, global = true, env = "DRIFTFIX_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format; overrides `log_format` from the config
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migration steps to every site, or to one
    Migrate {
        /// Only migrate this site (blog id)
        #[arg(long)]
        site: Option<String>,
        /// Migrate sites concurrently, one thread per site
        #[arg(long, conflicts_with = "site")]
        parallel: bool,
    },
    /// Show each site's applied version, pending steps and notices
    Status {
        /// Print machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Re-run one step by name without moving the watermark
    RunStep {
        name: String,
        /// Site to run on (default: the main site)
        #[arg(long)]
        site: Option<String>,
    },
    /// Forget the applied version of every site
    Uninstall,
    /// Start the HTTP migration trigger
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a migrate nonce for an administrator
    IssueNonce {
        #[arg(long)]
        user: String,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => ConfigLoader::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let loader = ConfigLoader::new(ConfigLoader::default_dir());
            loader.load().with_context(|| {
                format!("failed to load config from {}", loader.config_dir().display())
            })
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(cli.log_format.map(Into::into).unwrap_or(config.log_format));

    // Only `serve` needs an async runtime; the geocoder's blocking client
    // must not be used from inside one.
    match cli.command {
        Command::Migrate { site, parallel } => commands::migrate(&config, site.as_deref(), parallel),
        Command::Status { json } => commands::status(&config, json),
        Command::RunStep { name, site } => commands::run_step(&config, &name, site.as_deref()),
        Command::Uninstall => commands::uninstall(&config),
        Command::Serve { host, port } => commands::serve(config, host, port),
        Command::IssueNonce { user } => commands::issue_nonce(&config, &user),
    }
}
