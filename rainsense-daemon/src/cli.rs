use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

use rainsense_core::{
    ChainOptions, Config, DecisionEngine, LocationResolver, ProviderChain, ProviderId,
    QuietWindow, Scheduler, providers_from_config, scheduler::minute_of_day,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "rainsense", version, about = "Precipitation monitoring daemon")]
pub struct Cli {
    /// Alternate config file path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the polling daemon.
    Run,

    /// Resolve the location, poll once and print every output.
    Check,

    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "weatherapi".
        provider: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        match self.command {
            Command::Run => {
                let mut scheduler = build_scheduler(&config).await?;
                scheduler.run().await;
                Ok(())
            }
            Command::Check => check_once(&config).await,
            Command::Configure { provider } => configure(config, &provider, self.config.as_deref()),
        }
    }
}

/// Resolve the location, build the provider chain and one engine per
/// configured sensor.
async fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let storage_dir = Config::data_dir().ok();
    let resolver = LocationResolver::new(storage_dir.as_deref(), config.call_timeout());

    let location = resolver.resolve(&config.location, Utc::now()).await;
    match &location {
        Some(loc) => info!(
            coordinate = %loc.coordinate,
            source = loc.source.as_str(),
            "location resolved"
        ),
        None => warn!("no location resolved; location-dependent providers are disabled"),
    }

    let providers = providers_from_config(config, location.map(|l| l.coordinate))?;
    let chain = ProviderChain::new(
        providers,
        ChainOptions {
            cache_ttl: config.cache_ttl(),
            call_timeout: config.call_timeout(),
            backoff_schedule: config.backoff_schedule(),
        },
    )
    .context(
        "no usable weather provider; configure an API key or a location \
         (hint: `rainsense configure <provider>`)",
    )?;
    info!(providers = %chain.describe(), "provider chain ready");

    let quiet = match &config.quiet_hours {
        Some(q) => Some(
            QuietWindow::from_hhmm(&q.start, &q.end).context("invalid quiet_hours in config")?,
        ),
        None => None,
    };

    let engines: Vec<DecisionEngine> =
        config.sensors.iter().cloned().map(|sensor| DecisionEngine::new(sensor, quiet)).collect();

    Ok(Scheduler::new(Arc::new(chain), engines, config.poll_interval()))
}

async fn check_once(config: &Config) -> Result<()> {
    let mut scheduler = build_scheduler(config).await?;
    scheduler.tick(Utc::now(), minute_of_day(&chrono::Local::now())).await;

    println!("providers: {}", scheduler.chain().describe());
    for engine in scheduler.engines() {
        let diag = engine.diagnostics();
        let pop = diag.probability.map_or_else(|| "-".to_string(), |p| format!("{p:.0}%"));
        println!(
            "{:<12} {}  fault={}  rate={:.2} mm/h  pop={}  provider={}",
            engine.name(),
            if engine.is_active() { "ON " } else { "off" },
            engine.fault(),
            diag.rate_mm_h,
            pop,
            diag.provider.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

fn configure(mut config: Config, provider: &str, path: Option<&std::path::Path>) -> Result<()> {
    let id = ProviderId::try_from(provider)?;

    if !id.requires_api_key() {
        println!("Provider '{id}' needs no API key; nothing to configure.");
        return Ok(());
    }

    let api_key = inquire::Password::new(&format!("API key for {id}:"))
        .without_confirmation()
        .prompt()
        .context("failed to read API key")?;

    config.upsert_provider_api_key(id, api_key);
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }

    println!("Saved credentials for '{id}'.");
    Ok(())
}
