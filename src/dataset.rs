//! Gridded ocean data as returned by a remote provider

use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Error type for dataset construction
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A variable's value buffer does not match the size of the coordinate axes
    #[error("variable {variable} has {actual} values, expected {expected}")]
    ShapeMismatch {
        /// The variable whose values were the wrong length
        variable: Variable,
        /// time × latitude × longitude
        expected: usize,
        /// Length of the buffer actually supplied
        actual: usize,
    },
    /// A coordinate axis was not strictly ascending
    #[error("{0} axis is not strictly ascending")]
    UnsortedAxis(&'static str),
}

/// Ocean variables monitored by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variable {
    /// Sea water potential temperature
    Temperature,
    /// Sea surface height above geoid
    SeaSurfaceHeight,
}

impl Variable {
    /// Every monitored variable, in evaluation order
    pub const ALL: [Variable; 2] = [Variable::Temperature, Variable::SeaSurfaceHeight];

    /// Variable name used by the provider
    pub fn provider_code(self) -> &'static str {
        match self {
            Variable::Temperature => "thetao",
            Variable::SeaSurfaceHeight => "zos",
        }
    }

    /// Physical unit of the variable's values
    pub fn unit(self) -> &'static str {
        match self {
            Variable::Temperature => "°C",
            Variable::SeaSurfaceHeight => "m",
        }
    }

    /// Look up a variable by its provider code
    pub fn from_provider_code(code: &str) -> Option<Self> {
        Variable::ALL
            .into_iter()
            .find(|variable| variable.provider_code() == code)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Temperature => write!(f, "temperature"),
            Variable::SeaSurfaceHeight => write!(f, "sea surface height"),
        }
    }
}

/// Unreduced gridded data, indexed by (variable, time, latitude, longitude)
///
/// Values for each variable are stored flat in time-major, then latitude,
/// then longitude order. Missing cells (including NaN fill values from the
/// provider) are stored as `None`. A dataset is never mutated after it is
/// constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataset {
    times: Vec<DateTime<Utc>>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    values: BTreeMap<Variable, Vec<Option<f64>>>,
}

impl RawDataset {
    /// Construct a dataset, checking that each axis is strictly ascending and
    /// that every variable has exactly one value per grid cell
    pub fn new(
        times: Vec<DateTime<Utc>>,
        latitudes: Vec<f64>,
        longitudes: Vec<f64>,
        values: BTreeMap<Variable, Vec<Option<f64>>>,
    ) -> Result<Self, Error> {
        if !times.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::UnsortedAxis("time"));
        }
        if !latitudes.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::UnsortedAxis("latitude"));
        }
        if !longitudes.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::UnsortedAxis("longitude"));
        }

        let expected = times.len() * latitudes.len() * longitudes.len();
        let values = values
            .into_iter()
            .map(|(variable, cells)| {
                if cells.len() != expected {
                    return Err(Error::ShapeMismatch {
                        variable,
                        expected,
                        actual: cells.len(),
                    });
                }
                let cells = cells
                    .into_iter()
                    .map(|cell| cell.filter(|v| v.is_finite()))
                    .collect();
                Ok((variable, cells))
            })
            .collect::<Result<_, _>>()?;

        Ok(RawDataset {
            times,
            latitudes,
            longitudes,
            values,
        })
    }

    /// A dataset with an empty time axis, for windows where the provider has no data
    pub fn empty(variables: &[Variable]) -> Self {
        RawDataset {
            times: Vec::new(),
            latitudes: Vec::new(),
            longitudes: Vec::new(),
            values: variables.iter().map(|v| (*v, Vec::new())).collect(),
        }
    }

    #[allow(missing_docs)]
    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    #[allow(missing_docs)]
    pub fn latitudes(&self) -> &[f64] {
        &self.latitudes
    }

    #[allow(missing_docs)]
    pub fn longitudes(&self) -> &[f64] {
        &self.longitudes
    }

    /// Variables present in the dataset
    pub fn variables(&self) -> impl Iterator<Item = Variable> + '_ {
        self.values.keys().copied()
    }

    /// Number of grid cells in one time step
    pub fn cells_per_step(&self) -> usize {
        self.latitudes.len() * self.longitudes.len()
    }

    /// All cells of `variable` at time index `time_index`, latitude-major
    ///
    /// `None` if the variable is absent or the index is out of range.
    pub fn step(&self, variable: Variable, time_index: usize) -> Option<&[Option<f64>]> {
        let cells = self.cells_per_step();
        let start = time_index.checked_mul(cells)?;
        self.values.get(&variable)?.get(start..start + cells)
    }

    /// Select the time step nearest to `at` and return the 2-D grid of
    /// `variable` at that step
    ///
    /// Ties are broken towards the earlier timestamp. `None` if the dataset
    /// has no time steps or does not contain `variable`.
    pub fn slice_nearest(&self, variable: Variable, at: DateTime<Utc>) -> Option<GridSlice> {
        let (time_index, time) = self
            .times
            .iter()
            .enumerate()
            .min_by_key(|(_, time)| (**time - at).abs())?;

        Some(GridSlice {
            variable,
            time: *time,
            latitudes: self.latitudes.clone(),
            longitudes: self.longitudes.clone(),
            values: self.step(variable, time_index)?.to_vec(),
        })
    }
}

/// A single time step of one variable, for spatial rendering
#[derive(Debug, Clone, PartialEq)]
pub struct GridSlice {
    #[allow(missing_docs)]
    pub variable: Variable,
    /// Timestamp of the step actually selected
    pub time: DateTime<Utc>,
    #[allow(missing_docs)]
    pub latitudes: Vec<f64>,
    #[allow(missing_docs)]
    pub longitudes: Vec<f64>,
    /// Values in latitude-major order
    pub values: Vec<Option<f64>>,
}

impl GridSlice {
    /// Value at the given latitude and longitude indices
    pub fn get(&self, lat_index: usize, lon_index: usize) -> Option<f64> {
        if lon_index >= self.longitudes.len() {
            return None;
        }
        self.values
            .get(lat_index * self.longitudes.len() + lon_index)
            .copied()
            .flatten()
    }

    /// Minimum and maximum of the non-missing values, for scaling a colour map
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values.iter().flatten().fold(None, |range, v| match range {
            None => Some((*v, *v)),
            Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn hours(n: i64) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap();
        (0..n).map(|h| start + TimeDelta::hours(h)).collect()
    }

    fn sample() -> RawDataset {
        RawDataset::new(
            hours(3),
            vec![42.0, 42.5],
            vec![-9.0],
            BTreeMap::from([(
                Variable::Temperature,
                vec![Some(1.), Some(2.), Some(3.), None, Some(f64::NAN), Some(6.)],
            )]),
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let err = RawDataset::new(
            hours(2),
            vec![42.0],
            vec![-9.0],
            BTreeMap::from([(Variable::SeaSurfaceHeight, vec![Some(0.1)])]),
        )
        .unwrap_err();

        assert_eq!(
            err,
            Error::ShapeMismatch {
                variable: Variable::SeaSurfaceHeight,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_unsorted_axis() {
        let mut times = hours(2);
        times.reverse();
        let err = RawDataset::new(times, vec![], vec![], BTreeMap::new()).unwrap_err();
        assert_eq!(err, Error::UnsortedAxis("time"));
    }

    #[test]
    fn test_nan_becomes_missing() {
        assert_eq!(sample().step(Variable::Temperature, 2), Some(&[None, Some(6.)][..]));
    }

    #[test]
    fn test_slice_nearest() {
        let data = sample();
        let at = data.times()[1] + TimeDelta::minutes(20);

        let slice = data.slice_nearest(Variable::Temperature, at).unwrap();
        assert_eq!(slice.time, data.times()[1]);
        assert_eq!(slice.get(0, 0), Some(3.));
        assert_eq!(slice.get(1, 0), None);
        assert_eq!(slice.value_range(), Some((3., 3.)));

        assert!(data.slice_nearest(Variable::SeaSurfaceHeight, at).is_none());
        assert!(RawDataset::empty(&Variable::ALL)
            .slice_nearest(Variable::Temperature, at)
            .is_none());
    }

    #[test]
    fn test_provider_codes() {
        for variable in Variable::ALL {
            assert_eq!(
                Variable::from_provider_code(variable.provider_code()),
                Some(variable)
            );
        }
        assert_eq!(Variable::from_provider_code("uo"), None);
    }
}
