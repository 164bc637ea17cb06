//! Areal reduction of gridded data to per-site time series

use crate::dataset::{RawDataset, Variable};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Reduced values for one timestamp
///
/// A field is `None` when every grid cell for that variable was missing at
/// this timestamp, or the variable was not fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeriesRecord {
    #[allow(missing_docs)]
    pub temperature: Option<f64>,
    #[allow(missing_docs)]
    pub sea_surface_height: Option<f64>,
}

impl SeriesRecord {
    /// Value of `variable` in this record
    pub fn get(&self, variable: Variable) -> Option<f64> {
        match variable {
            Variable::Temperature => self.temperature,
            Variable::SeaSurfaceHeight => self.sea_surface_height,
        }
    }

    fn set(&mut self, variable: Variable, value: Option<f64>) {
        match variable {
            Variable::Temperature => self.temperature = value,
            Variable::SeaSurfaceHeight => self.sea_surface_height = value,
        }
    }
}

/// Per-timestamp areal means for one site, ascending by time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducedSeries {
    records: BTreeMap<DateTime<Utc>, SeriesRecord>,
}

impl ReducedSeries {
    /// Number of timestamps in the series
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at exactly `time`, if present
    pub fn get(&self, time: &DateTime<Utc>) -> Option<&SeriesRecord> {
        self.records.get(time)
    }

    /// All records, ascending by time
    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &SeriesRecord)> {
        self.records.iter()
    }

    /// The series of a single variable, ascending by time
    pub fn values(&self, variable: Variable) -> impl Iterator<Item = Option<f64>> + '_ {
        self.records.values().map(move |record| record.get(variable))
    }

    /// Whether any timestamp holds a value for any variable
    pub fn has_values(&self) -> bool {
        Variable::ALL
            .into_iter()
            .any(|variable| self.values(variable).any(|value| value.is_some()))
    }
}

impl FromIterator<(DateTime<Utc>, SeriesRecord)> for ReducedSeries {
    fn from_iter<I: IntoIterator<Item = (DateTime<Utc>, SeriesRecord)>>(iter: I) -> Self {
        ReducedSeries {
            records: iter.into_iter().collect(),
        }
    }
}

/// Collapse the latitude and longitude dimensions of `raw` into one mean per
/// variable per timestamp
///
/// Missing cells are ignored. If every cell of a variable is missing at a
/// timestamp, the reduced value is `None`, never zero. Timestamps are taken
/// exactly from `raw`; gaps are not filled.
pub fn reduce(raw: &RawDataset) -> ReducedSeries {
    raw.times()
        .iter()
        .enumerate()
        .map(|(time_index, time)| {
            let mut record = SeriesRecord::default();
            for variable in raw.variables() {
                record.set(
                    variable,
                    raw.step(variable, time_index).and_then(mean_of_present),
                );
            }
            (*time, record)
        })
        .collect()
}

fn mean_of_present(cells: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = cells
        .iter()
        .flatten()
        .fold((0., 0usize), |(sum, count), v| (sum + v, count + 1));

    (count > 0).then(|| sum / count as f64)
}
