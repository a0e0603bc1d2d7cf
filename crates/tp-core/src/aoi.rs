// SPDX-License-Identifier: MIT OR Apache-2.0
//! Areas of interest.
//!
//! An AOI travels as a GeoJSON `Feature` carrying a `MultiPolygon`
//! geometry and typed properties (a display name, a stable id, and an
//! open set of extra members). The geometry is always interpreted in
//! WGS84 ([`SRID`] 4326). The WKT writer exists for one purpose: the
//! deduplication key is derived from the canonical parameter JSON and
//! the WKT text of the geometry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Spatial reference identifier for all AOI geometries (WGS84).
pub const SRID: u32 = 4326;

/// AOI ids carrying this prefix mark demo computations; demo requests
/// are excluded from usage reporting.
pub const DEMO_AOI_ID_PREFIX: &str = "demo-";

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A single coordinate pair (longitude, latitude).
///
/// GeoJSON positions are arrays with two or more elements; any elements
/// past the first two are dropped on ingest.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Position {
    /// Longitude (x).
    pub x: f64,
    /// Latitude (y).
    pub y: f64,
}

impl Position {
    /// Create a position from longitude and latitude.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        if value.len() < 2 {
            return Err(format!(
                "a GeoJSON position needs at least two elements, got {}",
                value.len()
            ));
        }
        Ok(Self {
            x: value[0],
            y: value[1],
        })
    }
}

impl From<Position> for Vec<f64> {
    fn from(value: Position) -> Self {
        vec![value.x, value.y]
    }
}

// ---------------------------------------------------------------------------
// MultiPolygon
// ---------------------------------------------------------------------------

/// Coordinate array of a multi-polygon: polygons → rings → positions.
pub type MultiPolygonCoordinates = Vec<Vec<Vec<Position>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum MultiPolygonTag {
    MultiPolygon,
}

/// A GeoJSON `MultiPolygon` geometry.
///
/// Deserialisation rejects any other geometry type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiPolygon {
    #[serde(rename = "type")]
    tag: MultiPolygonTag,
    /// Polygons, each a list of linear rings (first is the exterior).
    pub coordinates: MultiPolygonCoordinates,
}

impl MultiPolygon {
    /// Create a multi-polygon from raw coordinates.
    pub fn new(coordinates: MultiPolygonCoordinates) -> Self {
        Self {
            tag: MultiPolygonTag::MultiPolygon,
            coordinates,
        }
    }

    /// An axis-aligned box as a single-polygon multi-polygon. Test and
    /// demo helper.
    pub fn bounding_box(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(vec![vec![vec![
            Position::new(min_x, min_y),
            Position::new(max_x, min_y),
            Position::new(max_x, max_y),
            Position::new(min_x, max_y),
            Position::new(min_x, min_y),
        ]]])
    }

    /// Write the geometry as WKT (`MULTIPOLYGON (((x y, …)))`).
    ///
    /// The output is a deterministic function of the coordinates; it
    /// feeds the deduplication key and must not be reformatted.
    pub fn to_wkt(&self) -> String {
        if self.coordinates.is_empty() {
            return "MULTIPOLYGON EMPTY".to_string();
        }
        let mut out = String::from("MULTIPOLYGON (");
        for (pi, polygon) in self.coordinates.iter().enumerate() {
            if pi > 0 {
                out.push_str(", ");
            }
            out.push('(');
            for (ri, ring) in polygon.iter().enumerate() {
                if ri > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                for (ci, pos) in ring.iter().enumerate() {
                    if ci > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{} {}", pos.x, pos.y);
                }
                out.push(')');
            }
            out.push(')');
        }
        out.push(')');
        out
    }
}

// ---------------------------------------------------------------------------
// AoiProperties
// ---------------------------------------------------------------------------

/// Typed properties of an AOI feature.
///
/// Extra members are preserved verbatim so clients can attach their own
/// metadata without the platform caring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AoiProperties {
    /// Human-readable name of the area of interest.
    pub name: String,
    /// Stable identifier of the area of interest.
    pub id: String,
    /// Additional opaque members.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AoiProperties {
    /// Create properties with no extra members.
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Whether this AOI marks a demo computation.
    pub fn is_demo(&self) -> bool {
        self.id.starts_with(DEMO_AOI_ID_PREFIX)
    }
}

// ---------------------------------------------------------------------------
// AoiFeature
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum FeatureTag {
    Feature,
}

/// A GeoJSON `Feature` wrapping a [`MultiPolygon`] and [`AoiProperties`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AoiFeature {
    #[serde(rename = "type")]
    tag: FeatureTag,
    /// The AOI geometry.
    pub geometry: MultiPolygon,
    /// The AOI properties.
    pub properties: AoiProperties,
}

impl AoiFeature {
    /// Wrap a geometry and properties into a feature.
    pub fn new(geometry: MultiPolygon, properties: AoiProperties) -> Self {
        Self {
            tag: FeatureTag::Feature,
            geometry,
            properties,
        }
    }

    /// WKT of the contained geometry.
    pub fn to_wkt(&self) -> String {
        self.geometry.to_wkt()
    }
}
