use crate::{
    cache::{CacheStats, ComputationError, ResultCache},
    data_client::{self, DatasetClient},
    dataset::{RawDataset, Variable},
    reduce::{reduce, ReducedSeries},
    region::{self, QueryRegion, Site, TimeWindow},
};
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Error type for per-site failures in an aggregation
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The site's footprint could not be resolved to a query region
    #[error(transparent)]
    InvalidGeometry(#[from] region::Error),
    /// A fetch outside the cache failed
    #[error("data client failed to fetch data: {0}")]
    DataClient(#[from] data_client::Error),
    /// The cached fetch-and-reduce computation for the site failed
    #[error(transparent)]
    Cache(#[from] ComputationError<data_client::Error>),
    /// Another site earlier in the same call has the same name
    #[error("site name `{0}` appears more than once")]
    DuplicateSite(String),
}

impl Error {
    /// The data client error behind this failure, if there is one
    pub fn data_client_error(&self) -> Option<&data_client::Error> {
        match self {
            Error::DataClient(e) => Some(e),
            Error::Cache(e) => Some(e.inner()),
            _ => None,
        }
    }
}

/// Key identifying one cached per-site result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Name of the site
    pub site_name: String,
    /// Window the result covers
    pub window: TimeWindow,
}

impl CacheKey {
    /// The default key: site name plus time window
    pub fn for_site(site: &Site, window: &TimeWindow) -> Self {
        CacheKey {
            site_name: site.name.clone(),
            window: *window,
        }
    }
}

/// Function deriving the cache key of a site's result
pub type KeyFn = fn(&Site, &TimeWindow) -> CacheKey;

/// Cache of reduced per-site series, shared by every aggregation of a [`Scheduler`]
pub type SeriesCache = ResultCache<CacheKey, Arc<ReducedSeries>, data_client::Error>;

/// Reduced series per site, in the order the sites were given
#[derive(Debug, Clone, Default)]
pub struct SiteResults {
    entries: Vec<(String, Arc<ReducedSeries>)>,
}

impl SiteResults {
    /// Append the series for `site_name`
    pub fn insert(&mut self, site_name: impl Into<String>, series: Arc<ReducedSeries>) {
        self.entries.push((site_name.into(), series));
    }

    #[allow(missing_docs)]
    pub fn get(&self, site_name: &str) -> Option<&ReducedSeries> {
        self.entries
            .iter()
            .find(|(name, _)| name == site_name)
            .map(|(_, series)| series.as_ref())
    }

    /// Sites and their series, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReducedSeries)> {
        self.entries
            .iter()
            .map(|(name, series)| (name.as_str(), series.as_ref()))
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Arc<ReducedSeries>)> for SiteResults {
    fn from_iter<I: IntoIterator<Item = (String, Arc<ReducedSeries>)>>(iter: I) -> Self {
        SiteResults {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A site that produced no result in an aggregation, and why
#[derive(Debug)]
pub struct SiteFailure {
    #[allow(missing_docs)]
    pub site_name: String,
    #[allow(missing_docs)]
    pub error: Error,
}

/// Outcome of [`Scheduler::aggregate`]
///
/// A site appears in exactly one of `results` or `failures`. A site missing
/// from `results` has no data; it must never be reported as within thresholds.
#[derive(Debug, Default)]
pub struct Aggregation {
    /// Reduced series of every site that succeeded
    pub results: SiteResults,
    /// Every site that failed, in the order the sites were given
    pub failures: Vec<SiteFailure>,
}

/// Knobs for the remote fetch policy of a [`Scheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Maximum remote fetches in flight at once, across all aggregations
    pub max_concurrent_fetches: usize,
    /// Extra attempts after a [`data_client::Error::RemoteUnavailable`]
    pub retries: u32,
    /// Wait before retry `n` is `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            max_concurrent_fetches: 4,
            retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Receiver type for aggregation runs
///
/// Holds the data client, the shared result cache, and the limit on
/// concurrent remote fetches. Share one `Scheduler` (e.g. behind an `Arc`)
/// between concurrent aggregations so they share the cache and the limit.
#[derive(Debug)]
pub struct Scheduler {
    client: DatasetClient,
    cache: SeriesCache,
    key_fn: KeyFn,
    fetch_permits: Semaphore,
    policy: FetchPolicy,
}

impl Scheduler {
    /// Instantiate a new scheduler
    pub fn new(client: DatasetClient, policy: FetchPolicy) -> Self {
        Scheduler {
            client,
            cache: SeriesCache::new(),
            key_fn: CacheKey::for_site,
            fetch_permits: Semaphore::new(policy.max_concurrent_fetches.max(1)),
            policy,
        }
    }

    /// Replace the function deriving cache keys from a site and window
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    #[allow(missing_docs)]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Whether a result is cached for `site` over `window`
    pub fn is_cached(&self, site: &Site, window: &TimeWindow) -> bool {
        self.cache.contains(&(self.key_fn)(site, window))
    }

    /// Fetch and reduce data for every site over `window`
    ///
    /// Sites are processed concurrently, with remote fetches bounded by
    /// [`FetchPolicy::max_concurrent_fetches`]. Results for a site and window
    /// already computed by this scheduler are served from its cache.
    ///
    /// A failing site never aborts the others: it is left out of the results
    /// and reported in [`Aggregation::failures`] instead. Both are in the
    /// order of `sites`, regardless of which fetch finished first.
    ///
    /// Dropping the returned future abandons all in-flight fetches without
    /// storing anything for them in the cache.
    pub async fn aggregate(&self, sites: &[Site], window: &TimeWindow) -> Aggregation {
        let mut seen = HashSet::new();
        let outcomes = join_all(sites.iter().map(|site| {
            let duplicate = !seen.insert(site.name.as_str());
            async move {
                if duplicate {
                    return Err(Error::DuplicateSite(site.name.clone()));
                }
                self.aggregate_site(site, window).await
            }
        }))
        .await;

        let mut aggregation = Aggregation::default();
        for (site, outcome) in sites.iter().zip(outcomes) {
            match outcome {
                Ok(series) => aggregation.results.insert(site.name.clone(), series),
                Err(error) => {
                    tracing::warn!(site = %site.name, %error, "no data for site");
                    aggregation.failures.push(SiteFailure {
                        site_name: site.name.clone(),
                        error,
                    });
                }
            }
        }

        tracing::info!(
            sites = sites.len(),
            succeeded = aggregation.results.len(),
            failed = aggregation.failures.len(),
            "aggregation complete"
        );
        aggregation
    }

    async fn aggregate_site(
        &self,
        site: &Site,
        window: &TimeWindow,
    ) -> Result<Arc<ReducedSeries>, Error> {
        let region = region::resolve(site)?;
        let key = (self.key_fn)(site, window);

        let series = self
            .cache
            .get_or_compute(key, || async move {
                let raw = self.fetch_with_retries(&region, window).await?;
                let series = reduce(&raw);
                tracing::debug!(site = %site.name, timestamps = series.len(), "reduced");
                Ok(Arc::new(series))
            })
            .await?;

        Ok(series)
    }

    /// Fetch the full grid over `region` for map display
    ///
    /// Not cached. Counts against the same concurrent fetch limit and retry
    /// policy as per-site fetches.
    pub async fn fetch_map(
        &self,
        region: &QueryRegion,
        window: &TimeWindow,
    ) -> Result<RawDataset, Error> {
        Ok(self.fetch_with_retries(region, window).await?)
    }

    async fn fetch_with_retries(
        &self,
        region: &QueryRegion,
        window: &TimeWindow,
    ) -> Result<RawDataset, data_client::Error> {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self.fetch_permits.acquire().await.map_err(|_| {
                    data_client::Error::RemoteUnavailable(String::from("fetch limiter closed"))
                })?;
                self.client.fetch(region, window, &Variable::ALL).await
            };

            match result {
                Err(data_client::Error::RemoteUnavailable(reason))
                    if attempt < self.policy.retries =>
                {
                    attempt += 1;
                    tracing::warn!(%reason, attempt, "remote unavailable, retrying");
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dev_utils::{hourly_window, square_site, test_client, TestDataSource};
    use std::time::Instant;

    async fn scheduler(
        source: TestDataSource,
        policy: FetchPolicy,
    ) -> (Scheduler, Arc<TestDataSource>) {
        let source = Arc::new(source);
        (
            Scheduler::new(test_client(Arc::clone(&source)).await, policy),
            source,
        )
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let window = hourly_window(3);
        let (a, b, c) = (
            square_site("a", 0., 0.),
            square_site("b", 1., 0.),
            square_site("c", 2., 0.),
        );
        let source = TestDataSource::new()
            .with_series(&a, &window, &[14., 16., 15.], &[0.1, 0.2, 0.3])
            .with_failure(&b)
            .with_series(&c, &window, &[10., 11., 12.], &[0.1, 0.2, 0.3]);
        let (scheduler, _) = scheduler(source, FetchPolicy::default()).await;

        let aggregation = scheduler.aggregate(&[a, b, c], &window).await;

        assert_eq!(
            aggregation.results.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(aggregation.failures.len(), 1);
        assert_eq!(aggregation.failures[0].site_name, "b");
        assert!(matches!(
            aggregation.failures[0].error.data_client_error(),
            Some(data_client::Error::RemoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_geometry_reported_per_site() {
        let window = hourly_window(2);
        let good = square_site("good", 0., 0.);
        let bad = Site::new("bad", geo::MultiPolygon::<f64>::new(vec![]));
        let source = TestDataSource::new().with_series(&good, &window, &[1., 2.], &[0., 0.]);
        let (scheduler, source) = scheduler(source, FetchPolicy::default()).await;

        let aggregation = scheduler.aggregate(&[bad, good], &window).await;

        assert_eq!(aggregation.results.len(), 1);
        assert!(matches!(
            aggregation.failures[0].error,
            Error::InvalidGeometry(region::Error::InvalidGeometry { .. })
        ));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_aggregation_is_cached() {
        let window = hourly_window(2);
        let site = square_site("a", 0., 0.);
        let source = TestDataSource::new().with_series(&site, &window, &[1., 2.], &[0., 0.]);
        let (scheduler, source) = scheduler(source, FetchPolicy::default()).await;
        let sites = [site];

        let first = scheduler.aggregate(&sites, &window).await;
        let second = scheduler.aggregate(&sites, &window).await;

        assert_eq!(source.fetch_count(), 1);
        assert_eq!(first.results.get("a"), second.results.get("a"));
        assert!(scheduler.is_cached(&sites[0], &window));

        // a different window is a different entry
        let later = hourly_window(3);
        scheduler.aggregate(&sites, &later).await;
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_site_names() {
        let window = hourly_window(1);
        let site = square_site("a", 0., 0.);
        let source = TestDataSource::new().with_series(&site, &window, &[1.], &[0.]);
        let (scheduler, _) = scheduler(source, FetchPolicy::default()).await;

        let aggregation = scheduler
            .aggregate(&[site.clone(), site], &window)
            .await;

        assert_eq!(aggregation.results.len(), 1);
        assert!(matches!(
            &aggregation.failures[0].error,
            Error::DuplicateSite(name) if name == "a"
        ));
    }

    #[tokio::test]
    async fn test_fetch_limit() {
        let window = hourly_window(1);
        let sites: Vec<_> = (0..4)
            .map(|i| square_site(&format!("s{i}"), i as f64, 0.))
            .collect();
        let source = TestDataSource::new().with_delay(Duration::from_millis(50));
        let (scheduler, source) = scheduler(
            source,
            FetchPolicy {
                max_concurrent_fetches: 1,
                ..FetchPolicy::default()
            },
        )
        .await;

        let start = Instant::now();
        let aggregation = scheduler.aggregate(&sites, &window).await;

        assert_eq!(aggregation.results.len(), 4);
        assert_eq!(source.fetch_count(), 4);
        assert_eq!(source.max_in_flight(), 1);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retries_remote_unavailable() {
        let window = hourly_window(2);
        let site = square_site("flaky", 0., 0.);
        let source = TestDataSource::new()
            .with_series(&site, &window, &[1., 2.], &[0., 0.])
            .failing_first(2);
        let (scheduler, source) = scheduler(
            source,
            FetchPolicy {
                retries: 2,
                retry_backoff: Duration::from_millis(1),
                ..FetchPolicy::default()
            },
        )
        .await;

        let aggregation = scheduler.aggregate(&[site], &window).await;

        assert!(aggregation.failures.is_empty());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_map_not_cached() {
        let window = hourly_window(2);
        let region = QueryRegion::new(-9.5, 42.0, -8.5, 43.0);
        let (scheduler, source) = scheduler(TestDataSource::new(), FetchPolicy::default()).await;

        scheduler.fetch_map(&region, &window).await.unwrap();
        scheduler.fetch_map(&region, &window).await.unwrap();

        assert_eq!(source.fetch_count(), 2);
        assert_eq!(scheduler.cache_stats(), CacheStats::default());
    }
}
