//! Definitions and utilities for deserialising monitoring configuration

use crate::{alarm::Thresholds, region::QueryRegion, scheduler::FetchPolicy};
use chronoutil::RelativeDuration;
use serde::Deserialize;
use std::{path::Path, time::Duration};
use thiserror::Error;

/// Product fetched when no `dataset_id` is configured: hourly 2-D physics
/// analysis/forecast for the Iberia-Biscay-Ireland area
pub const DEFAULT_DATASET_ID: &str = "cmems_mod_ibi_phy_anfc_0.027deg-2D_PT1H-m";

/// Monitoring configuration
///
/// Rather than constructing this manually, a convenience function `load_config` is provided to
/// deserialize it from a TOML file. Every key is optional, missing keys take their default.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Provider-side identifier of the gridded product to fetch
    pub dataset_id: String,
    /// Length of the monitored window, as an ISO 8601 duration
    pub time_window: String,
    /// Maximum remote fetches in flight at once
    pub max_concurrent_fetches: usize,
    /// Extra attempts after the provider is unreachable
    pub fetch_retries: u32,
    /// Base wait between retries, in milliseconds
    pub retry_backoff_ms: u64,
    /// Alarm thresholds
    pub thresholds: Thresholds,
    /// Fixed bounding box for the map display
    pub map_region: MapRegionConf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dataset_id: String::from(DEFAULT_DATASET_ID),
            time_window: String::from("PT24H"),
            max_concurrent_fetches: 4,
            fetch_retries: 0,
            retry_backoff_ms: 500,
            thresholds: Thresholds::default(),
            map_region: MapRegionConf::default(),
        }
    }
}

/// Bounding box of the map display, in lon-lat degrees
#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[allow(missing_docs)]
pub struct MapRegionConf {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Default for MapRegionConf {
    fn default() -> Self {
        MapRegionConf {
            min_lon: -9.5,
            min_lat: 42.0,
            max_lon: -8.5,
            max_lat: 43.0,
        }
    }
}

impl From<MapRegionConf> for QueryRegion {
    fn from(conf: MapRegionConf) -> Self {
        QueryRegion::new(conf.min_lon, conf.min_lat, conf.max_lon, conf.max_lat)
    }
}

impl Config {
    /// The monitored window length
    pub fn window_length(&self) -> Result<RelativeDuration, Error> {
        RelativeDuration::parse_from_iso8601(&self.time_window)
            .map_err(|e| Error::InvalidValue("time_window", e.to_string()))
    }

    #[allow(missing_docs)]
    pub fn map_region(&self) -> QueryRegion {
        self.map_region.into()
    }

    #[allow(missing_docs)]
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_concurrent_fetches: self.max_concurrent_fetches,
            retries: self.fetch_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Check values that deserialize fine but make no sense
    pub fn validate(&self) -> Result<(), Error> {
        if self.dataset_id.is_empty() {
            return Err(Error::InvalidValue(
                "dataset_id",
                String::from("must not be empty"),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::InvalidValue(
                "max_concurrent_fetches",
                String::from("must be at least 1"),
            ));
        }
        if !self.map_region().is_valid() {
            return Err(Error::InvalidValue(
                "map_region",
                String::from("bounds must be finite with min < max"),
            ));
        }
        for (key, value) in [
            ("thresholds.temperature_max", self.thresholds.temperature_max),
            (
                "thresholds.sea_surface_height_max",
                self.thresholds.sea_surface_height_max,
            ),
        ] {
            if !value.is_finite() {
                return Err(Error::InvalidValue(key, String::from("must be finite")));
            }
        }
        self.window_length()?;

        Ok(())
    }
}

/// Errors relating to config deserialization
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML deserialize error
    #[error("failed to deserialize toml: {0}")]
    TomlDeserialize(#[from] toml::de::Error),
    /// A key parsed but its value is unusable
    #[error("invalid value for `{0}`: {1}")]
    InvalidValue(&'static str, String),
}

/// Read and validate a monitoring config from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, Error> {
    let config: Config = toml::from_str(&std::fs::read_to_string(path)?)?;
    config.validate()?;
    Ok(config)
}
