//! Loading monitored sites from a GeoJSON FeatureCollection

use coastwatch::region::Site;
use geo::{LineString, MultiPolygon, Polygon};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to deserialize geojson: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature {0} has no `name` property")]
    MissingName(usize),
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Properties,
    geometry: Geometry,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    name: Option<String>,
}

type Ring = Vec<[f64; 2]>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

fn polygon(mut rings: Vec<Ring>) -> Polygon<f64> {
    if rings.is_empty() {
        return Polygon::new(LineString::new(vec![]), vec![]);
    }
    let exterior = rings.remove(0);
    Polygon::new(
        LineString::from(exterior),
        rings.into_iter().map(LineString::from).collect(),
    )
}

impl From<Geometry> for MultiPolygon<f64> {
    fn from(geometry: Geometry) -> Self {
        match geometry {
            Geometry::Polygon(rings) => MultiPolygon::new(vec![polygon(rings)]),
            Geometry::MultiPolygon(polygons) => {
                MultiPolygon::new(polygons.into_iter().map(polygon).collect())
            }
        }
    }
}

fn parse_sites(contents: &str) -> Result<Vec<Site>, Error> {
    let collection: FeatureCollection = serde_json::from_str(contents)?;
    collection
        .features
        .into_iter()
        .enumerate()
        .map(|(i, feature)| {
            let name = feature.properties.name.ok_or(Error::MissingName(i))?;
            Ok(Site::new(name, MultiPolygon::from(feature.geometry)))
        })
        .collect()
}

/// Read every Polygon or MultiPolygon feature of a GeoJSON file as a site,
/// named by its `name` property
pub fn load_sites(path: impl AsRef<Path>) -> Result<Vec<Site>, Error> {
    parse_sites(&std::fs::read_to_string(path)?)
}
