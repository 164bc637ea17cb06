//! System for near real time monitoring of coastal ocean conditions at fixed sites
//!
//! coastwatch fetches gridded sea temperature and sea surface height for the
//! footprint of every monitored site, reduces each footprint to an areal mean
//! per timestamp, and raises threshold alarms on the resulting series.
//!
//! The pipeline, leaf first:
//! - [`region::resolve`] turns a site's polygon into a bounding box to query
//! - a [`DatasetClient`](data_client::DatasetClient) fetches a
//!   [`RawDataset`](dataset::RawDataset) for that box from a remote provider
//!   through a [`DataConnector`](data_client::DataConnector)
//! - [`reduce::reduce`] collapses the grid into a
//!   [`ReducedSeries`](reduce::ReducedSeries)
//! - the [`Scheduler`] runs all of the above concurrently per site, caching
//!   results per site and time window
//! - [`evaluate`] scans the per-site series for threshold breaches
//!
//! ```
//! use coastwatch::{
//!     dev_utils::{hourly_window, square_site, test_client, TestDataSource},
//!     evaluate, FetchPolicy, Scheduler, Thresholds,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let window = hourly_window(3);
//! let site = square_site("Ría de Vigo", -8.8, 42.2);
//! let source = TestDataSource::new().with_series(&site, &window, &[14., 16., 15.], &[0.5, 0.6, 0.7]);
//!
//! let scheduler = Scheduler::new(test_client(Arc::new(source)).await, FetchPolicy::default());
//! let aggregation = scheduler.aggregate(&[site], &window).await;
//! let events = evaluate(&aggregation.results, &Thresholds::default());
//!
//! assert_eq!(events.len(), 1);
//! # }
//! ```

#![warn(missing_docs)]

pub mod alarm;
pub mod cache;
pub mod config;
pub mod data_client;
pub mod dataset;
pub mod dev_utils;
pub mod reduce;
pub mod region;
#[allow(missing_docs)]
pub mod scheduler;

pub use alarm::{evaluate, site_statuses, AlarmEvent, SiteStatus, Thresholds};
pub use config::{load_config, Config};
pub use scheduler::{Aggregation, FetchPolicy, Scheduler};
