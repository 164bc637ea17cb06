//! Utilities for testing code that uses coastwatch
//!
//! [`TestDataSource`] is a scripted in-memory [`DataConnector`]: register a
//! series per site footprint, mark footprints as failing, and add latency to
//! exercise concurrency.

use crate::{
    data_client::{self, Credentials, DataConnector, DataRequest, DatasetClient, Session},
    dataset::{RawDataset, Variable},
    region::{self, QueryRegion, Site, TimeWindow},
};
use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use chronoutil::RelativeDuration;
use geo::polygon;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Debug, Clone)]
enum Scripted {
    Data(RawDataset),
    Unavailable,
}

/// A [`DataConnector`] serving scripted data, for tests
#[derive(Debug, Default)]
pub struct TestDataSource {
    scripts: Vec<(QueryRegion, Scripted)>,
    delay: Option<Duration>,
    reject_login: bool,
    failing_first: usize,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TestDataSource {
    /// A source with no scripted data, which answers every request with an
    /// empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials the source accepts
    pub fn credentials() -> Credentials {
        Credentials {
            username: String::from("tester"),
            password: String::from("hunter2"),
        }
    }

    /// Serve hourly values from `window.start` for requests over `site`'s
    /// footprint. Every grid cell holds the given value
    ///
    /// # Panics
    ///
    /// If the site's geometry is invalid or the two series differ in length.
    pub fn with_series(
        mut self,
        site: &Site,
        window: &TimeWindow,
        temperature: &[f64],
        sea_surface_height: &[f64],
    ) -> Self {
        let region = region::resolve(site).expect("scripted site has valid geometry");
        let data = uniform_dataset(&region, window, temperature, sea_surface_height);
        self.scripts.push((region, Scripted::Data(data)));
        self
    }

    /// Serve an arbitrary dataset for requests over `region`
    pub fn with_dataset(mut self, region: QueryRegion, data: RawDataset) -> Self {
        self.scripts.push((region, Scripted::Data(data)));
        self
    }

    /// Fail every request over `site`'s footprint as unreachable
    ///
    /// # Panics
    ///
    /// If the site's geometry is invalid.
    pub fn with_failure(mut self, site: &Site) -> Self {
        let region = region::resolve(site).expect("scripted site has valid geometry");
        self.scripts.push((region, Scripted::Unavailable));
        self
    }

    /// Wait this long inside every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` fetches as unreachable, whatever their region
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failing_first = n;
        self
    }

    /// Reject every login
    pub fn reject_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// Number of fetches started so far, failed ones included
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataConnector for TestDataSource {
    fn name(&self) -> &str {
        "test"
    }

    async fn login(&self, credentials: &Credentials) -> Result<bool, data_client::Error> {
        let expected = Self::credentials();
        Ok(!self.reject_login
            && credentials.username == expected.username
            && credentials.password == expected.password)
    }

    async fn fetch_data(
        &self,
        _session: &Session,
        request: &DataRequest<'_>,
    ) -> Result<RawDataset, data_client::Error> {
        let nth = self.fetches.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if nth < self.failing_first {
            return Err(data_client::Error::RemoteUnavailable(format!(
                "scripted outage on fetch {nth}"
            )));
        }

        match self
            .scripts
            .iter()
            .find(|(region, _)| region == request.region)
        {
            Some((_, Scripted::Data(data))) => Ok(data.clone()),
            Some((_, Scripted::Unavailable)) => Err(data_client::Error::RemoteUnavailable(
                String::from("scripted outage"),
            )),
            None => Ok(RawDataset::empty(request.variables)),
        }
    }
}

/// A 2×2 grid over `region` where every cell at hour `i` after
/// `window.start` holds `temperature[i]` and `sea_surface_height[i]`
///
/// # Panics
///
/// If the two series differ in length.
pub fn uniform_dataset(
    region: &QueryRegion,
    window: &TimeWindow,
    temperature: &[f64],
    sea_surface_height: &[f64],
) -> RawDataset {
    assert_eq!(temperature.len(), sea_surface_height.len());
    const CELLS: usize = 4;
    let cells = |series: &[f64]| {
        series
            .iter()
            .flat_map(|v| std::iter::repeat(Some(*v)).take(CELLS))
            .collect::<Vec<_>>()
    };

    RawDataset::new(
        (0..temperature.len() as i64)
            .map(|h| window.start + TimeDelta::hours(h))
            .collect(),
        vec![region.min_lat, region.max_lat],
        vec![region.min_lon, region.max_lon],
        BTreeMap::from([
            (Variable::Temperature, cells(temperature)),
            (Variable::SeaSurfaceHeight, cells(sea_surface_height)),
        ]),
    )
    .expect("uniform grid is well formed")
}

/// A square site of side 0.1° with its south-west corner at `(lon, lat)`
pub fn square_site(name: &str, lon: f64, lat: f64) -> Site {
    Site::from_polygon(
        name,
        polygon![
            (x: lon, y: lat),
            (x: lon + 0.1, y: lat),
            (x: lon + 0.1, y: lat + 0.1),
            (x: lon, y: lat + 0.1),
            (x: lon, y: lat),
        ],
    )
}

/// A window of `hours` starting at a fixed instant
pub fn hourly_window(hours: i64) -> TimeWindow {
    let start = Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap();
    TimeWindow::new(start, start + RelativeDuration::hours(hours))
}

/// A [`DatasetClient`] logged in to `source`
///
/// # Panics
///
/// If `source` rejects logins.
pub async fn test_client(source: Arc<TestDataSource>) -> DatasetClient {
    let session = Session::establish(source.as_ref(), TestDataSource::credentials())
        .await
        .expect("test source accepts its own credentials");
    DatasetClient::new(source, session, "test_dataset")
}
