//! Connector for ERDDAP-style `griddap` servers
//!
//! Data is requested as a JSON table, one row per (time, latitude, longitude)
//! cell, and rebuilt into a dense grid.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use coastwatch::{
    data_client::{self, Credentials, DataConnector, DataRequest, Session},
    dataset::{RawDataset, Variable},
};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The table lacks a coordinate or requested variable column
    #[error("response has no `{0}` column")]
    MissingColumn(String),
    /// A cell is neither a value of the column's type nor null
    #[error("row {row}: column `{column}` does not hold a valid value")]
    InvalidCell { row: usize, column: String },
    /// The body is not a griddap JSON table
    #[error("could not parse response: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for data_client::Error {
    fn from(e: Error) -> Self {
        data_client::Error::Other(Box::new(e))
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    table: Table,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Table {
    column_names: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

/// Connector for a griddap server at `base_url`, e.g. `https://example.org/erddap`
#[derive(Debug, Clone)]
pub struct Griddap {
    client: reqwest::Client,
    base_url: String,
}

impl Griddap {
    /// A connector for the server rooted at `base_url`, trailing slashes ignored
    pub fn new(base_url: impl Into<String>) -> Self {
        Griddap {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, data_client::Error> {
        Url::parse(&format!("{}/{path}", self.base_url))
            .map_err(|e| data_client::Error::InvalidRequest(format!("bad url: {e}")))
    }
}

fn unavailable(e: reqwest::Error) -> data_client::Error {
    data_client::Error::RemoteUnavailable(e.to_string())
}

/// Query selecting every requested variable over the request's window and region
fn build_query(request: &DataRequest<'_>) -> String {
    let time = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
    let constraint = format!(
        "[({}):1:({})][({}):1:({})][({}):1:({})]",
        time(&request.window.start),
        time(&request.window.end),
        request.region.min_lat,
        request.region.max_lat,
        request.region.min_lon,
        request.region.max_lon,
    );

    request
        .variables
        .iter()
        .map(|v| format!("{}{constraint}", v.provider_code()))
        .collect::<Vec<_>>()
        .join(",")
}

fn column(names: &[String], name: &str) -> Result<usize, Error> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| Error::MissingColumn(name.to_string()))
}

fn sorted_axis(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut axis: Vec<f64> = values.collect();
    axis.sort_by(f64::total_cmp);
    axis.dedup();
    axis
}

/// Rebuild a dense grid from the rows of a griddap JSON table
fn parse_table(body: &str, variables: &[Variable]) -> Result<RawDataset, data_client::Error> {
    let table = serde_json::from_str::<Response>(body).map_err(Error::from)?.table;
    let names = &table.column_names;
    let (time_col, lat_col, lon_col) = (
        column(names, "time")?,
        column(names, "latitude")?,
        column(names, "longitude")?,
    );
    let variable_cols = variables
        .iter()
        .map(|v| -> Result<_, Error> { Ok((*v, column(names, v.provider_code())?)) })
        .collect::<Result<Vec<_>, Error>>()?;

    let invalid = |row, col: usize| Error::InvalidCell {
        row,
        column: names[col].clone(),
    };
    let cells = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| -> Result<_, Error> {
            let time = row
                .get(time_col)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .ok_or_else(|| invalid(i, time_col))?
                .with_timezone(&Utc);
            let lat = row
                .get(lat_col)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| invalid(i, lat_col))?;
            let lon = row
                .get(lon_col)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| invalid(i, lon_col))?;
            // null is a missing cell, anything else non-numeric is malformed
            let values = variable_cols
                .iter()
                .map(|(_, col)| match row.get(*col) {
                    Some(serde_json::Value::Null) => Ok(None),
                    Some(v) => v.as_f64().map(Some).ok_or_else(|| invalid(i, *col)),
                    None => Err(invalid(i, *col)),
                })
                .collect::<Result<Vec<_>, Error>>()?;
            Ok((time, lat, lon, values))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let times: Vec<_> = cells
        .iter()
        .map(|(t, ..)| *t)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let lats = sorted_axis(cells.iter().map(|(_, lat, ..)| *lat));
    let lons = sorted_axis(cells.iter().map(|(_, _, lon, _)| *lon));

    let size = times.len() * lats.len() * lons.len();
    let mut grids: Vec<Vec<Option<f64>>> = vec![vec![None; size]; variable_cols.len()];
    for (time, lat, lon, values) in &cells {
        // every coordinate was collected from these same cells, so lookups cannot miss
        let (Ok(t), Ok(y), Ok(x)) = (
            times.binary_search(time),
            lats.binary_search_by(|l| l.total_cmp(lat)),
            lons.binary_search_by(|l| l.total_cmp(lon)),
        ) else {
            continue;
        };
        let index = (t * lats.len() + y) * lons.len() + x;
        for (grid, value) in grids.iter_mut().zip(values) {
            grid[index] = *value;
        }
    }

    let values: BTreeMap<_, _> = variable_cols
        .iter()
        .map(|(v, _)| *v)
        .zip(grids)
        .collect();
    Ok(RawDataset::new(times, lats, lons, values)?)
}

fn login_outcome(status: StatusCode) -> Result<bool, data_client::Error> {
    match status {
        status if status.is_success() => Ok(true),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
        status => Err(data_client::Error::RemoteUnavailable(format!(
            "login answered with {status}"
        ))),
    }
}

fn fetch_outcome(
    status: StatusCode,
    body: &str,
    request: &DataRequest<'_>,
) -> Result<RawDataset, data_client::Error> {
    match status {
        status if status.is_success() => parse_table(body, request.variables),
        // griddap reports an empty selection as a 404
        StatusCode::NOT_FOUND if body.contains("no matching results") => {
            tracing::info!(dataset = request.dataset_id, "no data in window");
            Ok(RawDataset::empty(request.variables))
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Err(
            data_client::Error::InvalidRequest(format!("{status}: {body}")),
        ),
        status => Err(data_client::Error::RemoteUnavailable(format!(
            "fetch answered with {status}"
        ))),
    }
}

#[async_trait]
impl DataConnector for Griddap {
    fn name(&self) -> &str {
        "griddap"
    }

    async fn login(&self, credentials: &Credentials) -> Result<bool, data_client::Error> {
        let response = self
            .client
            .get(self.url("griddap/index.json")?)
            .query(&[("page", "1"), ("itemsPerPage", "1")])
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(unavailable)?;

        login_outcome(response.status())
    }

    async fn fetch_data(
        &self,
        session: &Session,
        request: &DataRequest<'_>,
    ) -> Result<RawDataset, data_client::Error> {
        let mut url = self.url(&format!("griddap/{}.json", request.dataset_id))?;
        url.set_query(Some(&build_query(request)));

        let credentials = session.credentials();
        let response = self
            .client
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;

        fetch_outcome(status, &body, request)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use coastwatch::region::{QueryRegion, TimeWindow};

    const BODY: &str = r#"{
      "table": {
        "columnNames": ["time", "latitude", "longitude", "thetao", "zos"],
        "columnTypes": ["String", "float", "float", "float", "float"],
        "columnUnits": ["UTC", "degrees_north", "degrees_east", "degC", "m"],
        "rows": [
          ["2024-05-14T00:00:00Z", 42.0, -9.0, 14.0, 0.5],
          ["2024-05-14T00:00:00Z", 42.0, -8.9, null, 0.7],
          ["2024-05-14T01:00:00Z", 42.0, -9.0, 15.0, null],
          ["2024-05-14T01:00:00Z", 42.0, -8.9, 16.0, null]
        ]
      }
    }"#;

    #[test]
    fn test_parse_table() {
        let data = parse_table(BODY, &Variable::ALL).unwrap();

        assert_eq!(data.times().len(), 2);
        assert_eq!(data.latitudes(), &[42.0]);
        assert_eq!(data.longitudes(), &[-9.0, -8.9]);
        assert_eq!(
            data.step(Variable::Temperature, 0),
            Some(&[Some(14.0), None][..])
        );
        assert_eq!(
            data.step(Variable::SeaSurfaceHeight, 1),
            Some(&[None, None][..])
        );
    }

    #[test]
    fn test_parse_table_missing_column() {
        let body = BODY.replace("\"zos\"", "\"so\"");
        assert!(matches!(
            parse_table(&body, &Variable::ALL),
            Err(data_client::Error::Other(_))
        ));
        assert!(parse_table(&body, &[Variable::Temperature]).is_ok());
    }

    #[test]
    fn test_parse_table_bad_cell() {
        let body = BODY.replace("14.0", "\"warm\"");
        let err = parse_table(&body, &Variable::ALL).unwrap_err();
        assert!(err.to_string().contains("thetao"));
    }

    fn window_and_region() -> (TimeWindow, QueryRegion) {
        let start = Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap();
        (
            TimeWindow::new(start, start + chrono::TimeDelta::hours(24)),
            QueryRegion::new(-9.5, 42.0, -8.5, 43.0),
        )
    }

    #[test]
    fn test_login_outcome() {
        assert!(login_outcome(StatusCode::OK).unwrap());
        assert!(!login_outcome(StatusCode::UNAUTHORIZED).unwrap());
        assert!(!login_outcome(StatusCode::FORBIDDEN).unwrap());
        assert!(matches!(
            login_outcome(StatusCode::BAD_GATEWAY),
            Err(data_client::Error::RemoteUnavailable(_))
        ));
    }

    #[test]
    fn test_fetch_outcome() {
        let (window, region) = window_and_region();
        let request = DataRequest {
            dataset_id: "ibi",
            region: &region,
            window: &window,
            variables: &Variable::ALL,
        };

        let data = fetch_outcome(StatusCode::OK, BODY, &request).unwrap();
        assert_eq!(data.times().len(), 2);

        let empty = fetch_outcome(
            StatusCode::NOT_FOUND,
            "Error {\n    code=404;\n    message=\"Not Found: Your query produced no matching results.\";\n}",
            &request,
        )
        .unwrap();
        assert!(empty.times().is_empty());
        assert_eq!(empty.variables().count(), 2);

        assert!(matches!(
            fetch_outcome(StatusCode::NOT_FOUND, "Resource not found: ibi", &request),
            Err(data_client::Error::InvalidRequest(_))
        ));
        assert!(matches!(
            fetch_outcome(StatusCode::BAD_REQUEST, "Query error: bad constraint", &request),
            Err(data_client::Error::InvalidRequest(_))
        ));
        assert!(matches!(
            fetch_outcome(StatusCode::SERVICE_UNAVAILABLE, "", &request),
            Err(data_client::Error::RemoteUnavailable(_))
        ));
    }

    #[test]
    fn test_url() {
        let griddap = Griddap::new("https://example.org/erddap/");
        assert_eq!(
            griddap.url("griddap/ibi.json").unwrap().as_str(),
            "https://example.org/erddap/griddap/ibi.json"
        );
        assert!(Griddap::new("not a url").url("griddap/index.json").is_err());
    }

    #[test]
    fn test_build_query() {
        let (window, region) = window_and_region();
        let query = build_query(&DataRequest {
            dataset_id: "ibi",
            region: &region,
            window: &window,
            variables: &Variable::ALL,
        });

        assert_eq!(
            query,
            "thetao[(2024-05-14T00:00:00Z):1:(2024-05-15T00:00:00Z)][(42):1:(43)][(-9.5):1:(-8.5)],\
             zos[(2024-05-14T00:00:00Z):1:(2024-05-15T00:00:00Z)][(42):1:(43)][(-9.5):1:(-8.5)]"
        );
    }
}
