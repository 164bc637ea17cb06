use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use coast_connectors::Griddap;
use coastwatch::{
    data_client::{Credentials, DataConnector, DatasetClient, Session},
    dataset::{RawDataset, Variable},
    evaluate, load_config,
    region::{Site, TimeWindow},
    site_statuses, Scheduler, SiteStatus,
};
use std::sync::Arc;
use tracing::Level;

mod sites;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MapVariable {
    Temperature,
    SeaSurfaceHeight,
}

impl From<MapVariable> for Variable {
    fn from(v: MapVariable) -> Self {
        match v {
            MapVariable::Temperature => Variable::Temperature,
            MapVariable::SeaSurfaceHeight => Variable::SeaSurfaceHeight,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = String::from("../sample_config/galicia.toml"))]
    config: String,
    #[arg(short, long, default_value_t = String::from("../sample_sites/galicia_mussel_farms.geojson"))]
    sites: String,
    #[arg(short = 'l', long, default_value_t = Level::INFO)]
    max_trace_level: Level,
    /// Root of the griddap server, e.g. https://example.org/erddap
    #[arg(long, env = "COASTWATCH_BASE_URL")]
    base_url: String,
    #[arg(long, env = "CMEMS_USER", default_value_t = String::from(""))]
    username: String,
    #[arg(long, env = "CMEMS_PASS", default_value_t = String::from(""), hide_env_values = true)]
    password: String,
    /// Variable to summarise over the map region
    #[arg(long, value_enum, default_value_t = MapVariable::Temperature)]
    map_variable: MapVariable,
    /// Timestamp to show on the map, defaults to the start of the window
    #[arg(long)]
    display_time: Option<DateTime<Utc>>,
}

fn print_statuses(statuses: &[SiteStatus]) {
    let mut alarms = 0;
    let mut unavailable = 0;
    for status in statuses {
        match status {
            SiteStatus::Alarm { events, .. } => {
                alarms += events.len();
                for event in events {
                    println!("ALARM {}", event.message);
                }
            }
            SiteStatus::Unavailable { site_name, reason } => {
                unavailable += 1;
                println!("UNAVAILABLE {site_name}: {reason}");
            }
            SiteStatus::WithinThresholds { site_name } => {
                println!("OK {site_name}");
            }
        }
    }

    if alarms == 0 && unavailable == 0 {
        println!("All values within safe thresholds");
    } else if alarms == 0 {
        println!("No alarms, but {unavailable} site(s) could not be checked");
    }
}

fn print_map(data: &RawDataset, variable: Variable, at: DateTime<Utc>, sites: &[Site]) {
    let Some(slice) = data.slice_nearest(variable, at) else {
        println!("No {variable} data to map");
        return;
    };

    println!(
        "{variable} at {}: {} x {} grid",
        slice.time,
        slice.latitudes.len(),
        slice.longitudes.len()
    );
    match slice.value_range() {
        Some((lo, hi)) => println!("  range {lo:.2} to {hi:.2} {}", variable.unit()),
        None => println!("  every cell is missing"),
    }
    for site in sites {
        if let Some(centroid) = site.centroid() {
            println!(
                "  marker {} at ({:.3}, {:.3})",
                site.name,
                centroid.x(),
                centroid.y()
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.max_trace_level)
        .init();

    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;
    let sites = sites::load_sites(&args.sites)
        .with_context(|| format!("failed to load sites from {}", args.sites))?;

    let connector: Arc<dyn DataConnector> = Arc::new(Griddap::new(args.base_url));
    let session = Session::establish(
        connector.as_ref(),
        Credentials {
            username: args.username,
            password: args.password,
        },
    )
    .await
    .context("could not log in to the data provider")?;

    let scheduler = Scheduler::new(
        DatasetClient::new(connector, session, &config.dataset_id),
        config.fetch_policy(),
    );
    let window = TimeWindow::anchored(Utc::now(), config.window_length()?);
    tracing::info!(start = %window.start, end = %window.end, sites = sites.len(), "monitoring");

    let map_region = config.map_region();
    let (aggregation, map) = tokio::join!(
        scheduler.aggregate(&sites, &window),
        scheduler.fetch_map(&map_region, &window),
    );

    let events = evaluate(&aggregation.results, &config.thresholds);
    let statuses = site_statuses(
        sites.iter().map(|site| site.name.as_str()),
        &aggregation,
        &events,
    );
    print_statuses(&statuses);

    match map {
        Ok(data) => print_map(
            &data,
            args.map_variable.into(),
            args.display_time.unwrap_or(window.start),
            &sites,
        ),
        Err(error) => tracing::error!(%error, "could not fetch map data"),
    }

    Ok(())
}
