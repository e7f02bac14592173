use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pawtrack_core::{
    Coordinate, CriteriaUpdate, FilteredResult, LastSeenLocation, PetSize, SightingRecord, Species,
    UserPosition,
};
use pawtrack_gateway::{HttpReportGateway, MemoryReportGateway, ReportGateway};
use pawtrack_search::{spawn_periodic_refresh, SearchConfig, SearchEngine};
use pawtrack_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pawtrack")]
#[command(about = "PawTrack lost & found pet search")]
struct Cli {
    /// YAML config file; environment variables still override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List active reports near a point, closest first.
    Nearby(NearbyArgs),
    /// Report a sighting of a lost pet.
    Sighting(SightingArgs),
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct NearbyArgs {
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
    #[arg(long)]
    radius: Option<f64>,
    #[arg(long)]
    species: Option<Species>,
    #[arg(long = "size")]
    sizes: Vec<PetSize>,
    #[arg(long)]
    recent: bool,
    #[arg(long)]
    reward: bool,
    /// Read reports from a JSON fixture instead of the API.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SightingArgs {
    #[arg(long)]
    pet_id: String,
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
    #[arg(long, default_value = "anonymous")]
    reporter: String,
    #[arg(long)]
    notes: Option<String>,
}

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

fn init_logging() -> Result<()> {
    if LOGGER_INIT.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
    let _ = LOGGER_INIT.set(());
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SearchConfig> {
    match path {
        Some(path) => SearchConfig::from_yaml_file(path),
        None => Ok(SearchConfig::from_env()),
    }
}

fn build_gateway(config: &SearchConfig, fixture: Option<&Path>) -> Result<Arc<dyn ReportGateway>> {
    match fixture {
        Some(path) => Ok(Arc::new(MemoryReportGateway::from_fixture(path)?)),
        None => Ok(Arc::new(
            HttpReportGateway::new(config.gateway_config()).context("creating api gateway")?,
        )),
    }
}

fn print_result(result: &FilteredResult) {
    if result.is_empty() {
        println!("no matching reports");
        return;
    }
    for entry in &result.entries {
        let report = &entry.report;
        let distance = entry
            .distance_km
            .map(|d| format!("{d:>6.2} km"))
            .unwrap_or_else(|| "     n/a ".to_string());
        let reward = report
            .reward_amount
            .filter(|amount| *amount > 0.0)
            .map(|amount| format!(" reward ${amount:.0}"))
            .unwrap_or_default();
        println!(
            "{distance}  {:<14} {}/{}  {}  {}{reward}",
            report.id,
            report.species.as_str(),
            report.size.as_str(),
            report.name,
            report.last_seen_location.city,
        );
    }
}

async fn run_nearby(config: SearchConfig, args: NearbyArgs) -> Result<()> {
    let gateway = build_gateway(&config, args.fixture.as_deref())?;
    let engine = SearchEngine::new(gateway, config)?;

    let update = CriteriaUpdate {
        radius_km: args.radius,
        species: args.species.map(Some),
        sizes: (!args.sizes.is_empty()).then(|| args.sizes.into_iter().collect()),
        recent_only: Some(args.recent),
        reward_only: Some(args.reward),
    };
    engine.update_criteria(update)?;

    let here = Coordinate::new(args.lat, args.lon)?;
    engine.set_position(Some(UserPosition::new(here, Utc::now())))?;

    let result = engine.refresh().await?;
    print_result(&result);
    Ok(())
}

async fn run_sighting(config: SearchConfig, args: SightingArgs) -> Result<()> {
    let gateway = build_gateway(&config, None)?;
    let location = LastSeenLocation::at(Coordinate::new(args.lat, args.lon)?);
    let mut sighting = SightingRecord::new(args.pet_id, args.reporter, location, Utc::now())?;
    sighting.notes = args.notes;
    gateway
        .submit_sighting(&sighting)
        .await
        .context("submitting sighting")?;
    println!("sighting recorded: id={} pet={}", sighting.id, sighting.pet_id);
    Ok(())
}

async fn run_serve(config: SearchConfig, fixture: Option<PathBuf>) -> Result<()> {
    let gateway = build_gateway(&config, fixture.as_deref())?;
    let port = config.web_port;
    let interval = config.refresh_interval();
    let engine = Arc::new(SearchEngine::new(gateway, config)?);

    if let Err(err) = engine.refresh().await {
        warn!(%err, "initial refresh failed; serving empty results until the next refresh");
    }
    if let Some(every) = interval {
        info!(?every, "periodic refresh enabled");
        spawn_periodic_refresh(Arc::clone(&engine), every);
    }

    pawtrack_web::serve(AppState::new(engine), port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Nearby(args) => run_nearby(config, args).await?,
        Commands::Sighting(args) => run_sighting(config, args).await?,
        Commands::Serve { fixture } => run_serve(config, fixture).await?,
    }

    Ok(())
}
