//! Utilities for creating and using [`DataConnector`](crate::data_client::DataConnector)s
//!
//! Implementations of the [`DataConnector`](crate::data_client::DataConnector)
//! trait are how coastwatch accesses remote gridded ocean data. For any
//! provider you wish coastwatch to pull data from, you must write an
//! implementation of [`DataConnector`](crate::data_client::DataConnector) for
//! it, authenticate against it once with [`Session::establish`], and wrap both
//! in a [`DatasetClient`], which you then pass to
//! [`Scheduler::new`](crate::Scheduler::new).

use crate::{
    dataset::{self, RawDataset, Variable},
    region::{QueryRegion, TimeWindow},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Error type for DatasetClient
///
/// When implementing DataConnector, it may be helpful to implement your own
/// internal Error type, but it must ultimately be mapped to this type before
/// returning
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The request parameters were malformed. This is a programming or
    /// configuration error, and will not go away by retrying
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The provider could not be reached, or refused the session
    #[error("remote provider unavailable: {0}")]
    RemoteUnavailable(String),
    /// The provider rejected the supplied credentials at login
    #[error("authentication with {provider} failed")]
    Authentication {
        /// Name of the provider that rejected the login
        provider: String,
    },
    /// The provider answered, but with data that could not form a dataset
    #[error("malformed dataset from provider: {0}")]
    Dataset(#[from] dataset::Error),
    /// Catchall for any other errors that might occur inside a DataConnector object
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Username and password for a remote provider
#[derive(Clone)]
pub struct Credentials {
    #[allow(missing_docs)]
    pub username: String,
    #[allow(missing_docs)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated session with a remote provider
///
/// Constructed once at process start with [`Session::establish`], then shared
/// read-only by every fetch. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Session {
    credentials: Arc<Credentials>,
    established_at: DateTime<Utc>,
}

impl Session {
    /// Log in to the provider behind `connector`
    ///
    /// # Errors
    ///
    /// [`Error::Authentication`] if the provider rejects the credentials, or
    /// whatever error the connector hit while trying to reach it. Either way
    /// no fetch can proceed, so callers should treat this as fatal.
    pub async fn establish(
        connector: &dyn DataConnector,
        credentials: Credentials,
    ) -> Result<Self, Error> {
        if !connector.login(&credentials).await? {
            tracing::error!(provider = connector.name(), "login rejected");
            return Err(Error::Authentication {
                provider: connector.name().to_string(),
            });
        }
        tracing::info!(provider = connector.name(), user = %credentials.username, "logged in");

        Ok(Session {
            credentials: Arc::new(credentials),
            established_at: Utc::now(),
        })
    }

    /// Credentials the session was established with
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[allow(missing_docs)]
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

/// Specifier of which data to fetch from a provider
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest<'a> {
    /// Provider-side identifier of the gridded product
    pub dataset_id: &'a str,
    /// Spatial extent of the data to fetch
    pub region: &'a QueryRegion,
    /// Temporal extent of the data to fetch
    pub window: &'a TimeWindow,
    /// Variables to fetch, non-empty and without duplicates
    pub variables: &'a [Variable],
}

/// Trait for pulling gridded data from remote providers
///
/// Uses [mod@async_trait]. It is recommended to tag your implementation with
/// the [`macro@async_trait`] macro to avoid having to deal with pinning,
/// futures, and lifetimes manually.
///
/// Here is an example implementation that just returns an empty dataset:
///
/// ```
/// use async_trait::async_trait;
/// use coastwatch::{
///     data_client::{self, *},
///     dataset::RawDataset,
/// };
///
/// // You can use the receiver type to store anything that should persist
/// // between requests, i.e an HTTP client
/// #[derive(Debug)]
/// struct EmptySource;
///
/// #[async_trait]
/// impl DataConnector for EmptySource {
///     fn name(&self) -> &str {
///         "empty"
///     }
///
///     async fn login(&self, _credentials: &Credentials) -> Result<bool, data_client::Error> {
///         Ok(true)
///     }
///
///     async fn fetch_data(
///         &self,
///         // Holds the credentials the provider accepted at login
///         _session: &Session,
///         // Dataset id, region, time window and variables to fetch
///         request: &DataRequest<'_>,
///     ) -> Result<RawDataset, data_client::Error> {
///         // Here you can do whatever is needed to fetch real data, whether
///         // that's a REST request, an OPeNDAP call, a file read etc.
///         Ok(RawDataset::empty(request.variables))
///     }
/// }
/// ```
///
/// A real implementation can be found in the `coast_connectors` crate.
#[async_trait]
pub trait DataConnector: Send + Sync + fmt::Debug {
    /// Human readable name of the provider, for logs
    fn name(&self) -> &str;

    /// Check credentials against the provider
    ///
    /// Returns `Ok(false)` if the provider was reached but rejected them.
    async fn login(&self, credentials: &Credentials) -> Result<bool, Error>;

    /// Fetch the requested data
    ///
    /// The returned dataset must cover at least the requested region and
    /// window, clipped to what the provider has. If the provider has no data
    /// in the window, return a dataset with an empty time axis rather than
    /// an error.
    async fn fetch_data(
        &self,
        session: &Session,
        request: &DataRequest<'_>,
    ) -> Result<RawDataset, Error>;
}

/// Client for one gridded product of one remote provider
///
/// Validates requests before they go out, and issues exactly one remote query
/// per [`fetch`](DatasetClient::fetch). Failures are propagated, never retried
/// here.
#[derive(Debug, Clone)]
pub struct DatasetClient {
    connector: Arc<dyn DataConnector>,
    session: Session,
    dataset_id: String,
}

impl DatasetClient {
    /// Instantiate a new DatasetClient
    pub fn new(
        connector: Arc<dyn DataConnector>,
        session: Session,
        dataset_id: impl Into<String>,
    ) -> Self {
        DatasetClient {
            connector,
            session,
            dataset_id: dataset_id.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Fetch `variables` over `region` and `window`
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the region or window are empty or
    /// inverted, or `variables` is empty or repeats a variable. Otherwise
    /// whatever the connector returns.
    pub async fn fetch(
        &self,
        region: &QueryRegion,
        window: &TimeWindow,
        variables: &[Variable],
    ) -> Result<RawDataset, Error> {
        validate_request(region, window, variables)?;

        let request = DataRequest {
            dataset_id: &self.dataset_id,
            region,
            window,
            variables,
        };
        tracing::debug!(?request, provider = self.connector.name(), "fetching");

        self.connector.fetch_data(&self.session, &request).await
    }
}

fn validate_request(
    region: &QueryRegion,
    window: &TimeWindow,
    variables: &[Variable],
) -> Result<(), Error> {
    if !region.is_valid() {
        return Err(Error::InvalidRequest(format!(
            "region {region:?} must have finite bounds with min < max on both axes"
        )));
    }
    if !window.is_valid() {
        return Err(Error::InvalidRequest(format!(
            "time window start {} is not before end {}",
            window.start, window.end
        )));
    }
    if variables.is_empty() {
        return Err(Error::InvalidRequest(String::from("no variables requested")));
    }
    if variables
        .iter()
        .enumerate()
        .any(|(i, v)| variables[..i].contains(v))
    {
        return Err(Error::InvalidRequest(String::from(
            "variables requested more than once",
        )));
    }

    Ok(())
}
