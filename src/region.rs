//! Sites, query regions and time windows
//!
//! A [`Site`] is a named polygon footprint. Before any data can be fetched for
//! it, its footprint is resolved into an axis-aligned [`QueryRegion`] with
//! [`resolve`].

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use chronoutil::{DateRule, RelativeDuration};
use geo::{BoundingRect, Centroid, CoordsIter, MultiPolygon, Point, Polygon};
use thiserror::Error;

/// Error type for region resolution
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The site's geometry cannot produce a usable query region
    #[error("site `{site}` has invalid geometry: {reason}")]
    InvalidGeometry {
        /// Name of the offending site
        site: String,
        /// What was wrong with it
        reason: &'static str,
    },
}

/// A named geographic area of interest
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// Name of the site, unique within one run
    pub name: String,
    /// Footprint of the site in lon-lat degrees
    pub geometry: MultiPolygon<f64>,
}

impl Site {
    /// Construct a site from any single polygon or multipolygon footprint
    pub fn new(name: impl Into<String>, geometry: impl Into<MultiPolygon<f64>>) -> Self {
        Site {
            name: name.into(),
            geometry: geometry.into(),
        }
    }

    /// Construct a site from a single polygon footprint
    pub fn from_polygon(name: impl Into<String>, polygon: Polygon<f64>) -> Self {
        Site::new(name, MultiPolygon::new(vec![polygon]))
    }

    /// Centroid of the footprint, used only for labelling sites on a map
    ///
    /// `None` if the footprint is empty.
    pub fn centroid(&self) -> Option<Point<f64>> {
        self.geometry.centroid()
    }
}

/// Axis-aligned bounding box in lon-lat degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryRegion {
    #[allow(missing_docs)]
    pub min_lon: f64,
    #[allow(missing_docs)]
    pub min_lat: f64,
    #[allow(missing_docs)]
    pub max_lon: f64,
    #[allow(missing_docs)]
    pub max_lat: f64,
}

impl QueryRegion {
    /// Construct a region from its bounds, in `[min_lon, min_lat, max_lon, max_lat]` order
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        QueryRegion {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Whether all bounds are finite and `min < max` holds on both axes
    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .all(|b| b.is_finite())
            && self.min_lon < self.max_lon
            && self.min_lat < self.max_lat
    }

    /// Whether the point `(lon, lat)` lies inside the region, bounds included
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&lon) && (self.min_lat..=self.max_lat).contains(&lat)
    }
}

/// Half-open interval `[start, end)` of interest for data retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    /// Start of the window, inclusive
    pub start: DateTime<Utc>,
    /// End of the window, exclusive
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Construct a new `TimeWindow`. No validation is done here, the data
    /// client rejects windows where `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeWindow { start, end }
    }

    /// A window of `length` starting at `now` truncated to the whole hour
    pub fn anchored(now: DateTime<Utc>, length: RelativeDuration) -> Self {
        // truncation to an hour on a UTC timestamp cannot overflow
        let start = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
        TimeWindow {
            start,
            end: start + length,
        }
    }

    /// Whether `start < end`
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Whether `time` lies in `[start, end)`
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }

    /// Timestamps from `start` at `resolution` steps, stopping before `end`
    ///
    /// These are the candidate display times for the map view.
    pub fn steps(&self, resolution: RelativeDuration) -> impl Iterator<Item = DateTime<Utc>> {
        let end = self.end;
        DateRule::new(self.start, resolution).take_while(move |time| *time < end)
    }
}

/// Resolve a site's footprint into the exact bounding box of its geometry
///
/// # Errors
///
/// [`Error::InvalidGeometry`] if the geometry is empty, has non-finite
/// coordinates, or collapses to zero width or height.
pub fn resolve(site: &Site) -> Result<QueryRegion, Error> {
    let invalid = |reason| Error::InvalidGeometry {
        site: site.name.clone(),
        reason,
    };

    let rect = site
        .geometry
        .bounding_rect()
        .ok_or_else(|| invalid("geometry is empty"))?;

    if site
        .geometry
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(invalid("bounds are not finite"));
    }

    let region = QueryRegion::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
    if !region.is_valid() {
        return Err(invalid("bounds have zero area"));
    }

    Ok(region)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use geo::polygon;

    #[test]
    fn test_resolve_exact_bounds() {
        let site = Site::from_polygon(
            "Ría de Arousa",
            polygon![
                (x: -8.90, y: 42.58),
                (x: -8.80, y: 42.57),
                (x: -8.82, y: 42.65),
                (x: -8.90, y: 42.58),
            ],
        );

        let region = resolve(&site).unwrap();
        assert_eq!(region, QueryRegion::new(-8.90, 42.57, -8.80, 42.65));
    }

    #[test]
    fn test_resolve_multipolygon_covers_all_parts() {
        let site = Site::new(
            "split",
            MultiPolygon::new(vec![
                polygon![(x: 0., y: 0.), (x: 1., y: 0.), (x: 1., y: 1.), (x: 0., y: 0.)],
                polygon![(x: 4., y: 2.), (x: 5., y: 2.), (x: 5., y: 3.), (x: 4., y: 2.)],
            ]),
        );

        assert_eq!(resolve(&site).unwrap(), QueryRegion::new(0., 0., 5., 3.));
    }

    #[test]
    fn test_resolve_empty_geometry() {
        let site = Site::new("empty", MultiPolygon::<f64>::new(vec![]));

        assert!(matches!(
            resolve(&site),
            Err(Error::InvalidGeometry { site, .. }) if site == "empty"
        ));
    }

    #[test]
    fn test_resolve_degenerate_geometry() {
        let site = Site::from_polygon(
            "line",
            polygon![(x: 1., y: 1.), (x: 2., y: 1.), (x: 1., y: 1.)],
        );

        assert!(resolve(&site).is_err());
    }

    #[test]
    fn test_resolve_non_finite_geometry() {
        let site = Site::from_polygon(
            "nan",
            polygon![(x: 0., y: 0.), (x: f64::NAN, y: 1.), (x: 1., y: 1.), (x: 0., y: 0.)],
        );

        assert!(resolve(&site).is_err());
    }

    #[test]
    fn test_anchored_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 14, 9, 42, 17).unwrap();
        let window = TimeWindow::anchored(now, RelativeDuration::hours(24));

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 5, 14, 9, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap());
        assert!(window.is_valid());
    }

    #[test]
    fn test_window_steps_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + RelativeDuration::hours(3));

        let steps: Vec<_> = window.steps(RelativeDuration::hours(1)).collect();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], start);
        assert!(!window.contains(window.end));
    }
}
