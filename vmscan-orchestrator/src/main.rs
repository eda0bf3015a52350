//! # vmscan orchestrator
//!
//! Polls scan configurations, fires the ones that are due and drives every
//! fired scan through snapshotting, scanner provisioning, result collection
//! and cleanup.
//!
//! Configuration is read from `.env`, an optional TOML/JSON file and
//! `VMSCAN_*` variables; see `vmscan-config`. `vmscan-orchestrator config`
//! prints the effective settings.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vmscan_config::{Settings, SettingsLoad, SettingsSource};
use vmscan_core::backend::HttpBackendClient;
use vmscan_core::orchestrator::Orchestrator;
use vmscan_core::provider::external::ExternalProvider;
use vmscan_core::provider::{ProviderClient, ProviderKind};

#[derive(Parser, Debug)]
#[command(name = "vmscan-orchestrator")]
#[command(about = "Schedules and runs agentless VM security scans")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct Overrides {
    /// Settings file (TOML or JSON); takes precedence over VMSCAN_CONFIG_PATH
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Backend API base URL
    #[arg(long, global = true)]
    backend_address: Option<String>,

    /// Address of the provider plugin
    #[arg(long, global = true)]
    plugin_address: Option<String>,
}

impl Overrides {
    fn lookup(&self, var: &str) -> Option<String> {
        match var {
            "VMSCAN_CONFIG_PATH" => {
                self.config.as_ref().map(|p| p.display().to_string())
            }
            "VMSCAN_BACKEND_ADDRESS" => self.backend_address.clone(),
            "VMSCAN_PLUGIN_ADDRESS" => self.plugin_address.clone(),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the orchestrator until interrupted (default)
    Run,
    /// Print the effective settings as TOML and exit
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmscan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let env_file_loaded = Settings::load_env_file()?;
    let mut load = Settings::load_with(&|var| {
        cli.overrides
            .lookup(var)
            .or_else(|| std::env::var(var).ok())
    })
    .context("failed to load configuration")?;
    load.env_file_loaded = env_file_loaded;

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            print!("{}", load.settings.to_toml()?);
            Ok(())
        }
        Command::Run => run(load).await,
    }
}

async fn run(load: SettingsLoad) -> anyhow::Result<()> {
    let SettingsLoad {
        settings,
        source,
        env_file_loaded,
    } = load;

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        SettingsSource::Default => info!("using default settings"),
        SettingsSource::EnvPath(path) | SettingsSource::File(path) => {
            info!(path = %path.display(), "settings loaded from file")
        }
        SettingsSource::EnvInline => {
            info!("settings loaded from inline environment json")
        }
    }

    let backend = HttpBackendClient::new(
        settings.backend_url()?,
        settings.backend_timeout(),
    )
    .context("failed to build backend client")?;
    let provider = build_provider(&settings)?;

    let orchestrator = &settings.orchestrator;
    info!(
        backend = %settings.backend.address,
        provider = %settings.provider.kind,
        region = %orchestrator.placement.region,
        scanner.max_parallel = orchestrator.scanner.max_parallel_scanners,
        scanner.delete_policy = %orchestrator.scanner.delete_job_policy,
        watcher.poll_interval_ms = orchestrator.watcher.poll_interval_ms,
        "orchestrator configuration in effect"
    );

    let orchestrator =
        Orchestrator::new(orchestrator.clone(), Arc::new(backend), provider);
    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;

    shutdown_signal().await?;
    info!("shutdown signal received");

    orchestrator.stop().await?;
    Ok(())
}

fn build_provider(settings: &Settings) -> anyhow::Result<Arc<dyn ProviderClient>> {
    match settings.provider.kind {
        ProviderKind::External => {
            let config = settings.plugin_config()?;
            let provider = ExternalProvider::new(&config)
                .context("failed to build plugin provider")?;
            Ok(Arc::new(provider))
        }
        other => bail!(
            "provider `{other}` is not built in; run it as a plugin and set \
             VMSCAN_PROVIDER=external"
        ),
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
            }
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")
    }
}
