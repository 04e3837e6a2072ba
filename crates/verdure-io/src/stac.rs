//! STAC (SpatioTemporal Asset Catalog) item models.
//!
//! Covers the subset of an Item Collection that scene selection needs:
//! id, collection, acquisition datetime, cloud cover, projection EPSG,
//! footprint geometry (or bbox), and asset hrefs.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use geo::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};
use verdure_pipeline::{Crs, SceneCandidate};

use crate::error::IoError;

/// A STAC Item Collection (GeoJSON FeatureCollection).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemCollection {
    /// GeoJSON type, always `FeatureCollection`.
    #[serde(rename = "type", default = "feature_collection")]
    pub type_: String,

    /// Items of the collection.
    pub features: Vec<Item>,
}

fn feature_collection() -> String {
    "FeatureCollection".to_string()
}

/// A single STAC Item (GeoJSON Feature).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Item {
    /// Unique item identifier.
    pub id: String,

    /// Collection this item belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Footprint as a GeoJSON geometry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,

    /// Bounding box `[west, south, east, north]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,

    /// Acquisition metadata.
    pub properties: ItemProperties,

    /// Assets keyed by name, e.g. `nir`.
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

/// GeoJSON geometry, limited to the polygon types footprints use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Vec<[f64; 2]>>),
    MultiPolygon(Vec<Vec<Vec<[f64; 2]>>>),
}

/// STAC Item properties.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemProperties {
    /// ISO 8601 datetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,

    /// Cloud cover percentage (EO extension).
    #[serde(rename = "eo:cloud_cover", skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,

    /// Native CRS (projection extension).
    #[serde(rename = "proj:epsg", skip_serializing_if = "Option::is_none")]
    pub epsg: Option<u32>,
}

/// A single STAC Asset (file reference).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Asset {
    /// Location of the asset file.
    pub href: String,

    /// Media type, e.g. `application/json`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Item {
    /// Convert into a pipeline [`SceneCandidate`].
    ///
    /// `eo:cloud_cover` is a percentage and becomes a fraction; a missing
    /// value counts as fully clouded so such items rank last. The footprint
    /// is the geometry's outer ring (the largest polygon of a
    /// multipolygon), falling back to the bbox. Without `proj:epsg` the
    /// assets are assumed to be in WGS84.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::InvalidItem`] when the datetime is missing or
    /// unparseable, or the item has neither geometry nor bbox.
    pub fn to_candidate(&self, default_collection: &str) -> Result<SceneCandidate, IoError> {
        let invalid = |reason: String| IoError::InvalidItem {
            id: self.id.clone(),
            reason,
        };

        let datetime = self
            .properties
            .datetime
            .as_deref()
            .ok_or_else(|| invalid("missing properties.datetime".to_string()))?;
        let acquired = datetime
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .ok_or_else(|| invalid(format!("unparseable datetime {datetime:?}")))?;

        let footprint = self
            .footprint()
            .ok_or_else(|| invalid("item has neither geometry nor bbox".to_string()))?;

        let cloud_cover = self.properties.cloud_cover.map_or(1.0, |pct| pct / 100.0);
        let crs = self.properties.epsg.map_or(Crs::Wgs84, Crs::from_epsg);
        let collection = self.collection.as_deref().unwrap_or(default_collection);

        Ok(self.assets.iter().fold(
            SceneCandidate::new(&self.id, collection, acquired, cloud_cover, footprint, crs),
            |scene, (key, asset)| scene.with_asset(key, &asset.href),
        ))
    }

    fn footprint(&self) -> Option<Polygon<f64>> {
        let ring = match &self.geometry {
            Some(Geometry::Polygon(rings)) => rings.first(),
            Some(Geometry::MultiPolygon(polygons)) => polygons
                .iter()
                .filter_map(|rings| rings.first())
                .max_by_key(|ring| ring.len()),
            None => None,
        };
        if let Some(ring) = ring.filter(|r| r.len() >= 4) {
            let coords: Vec<Coord<f64>> = ring.iter().map(|&[x, y]| Coord { x, y }).collect();
            return Some(Polygon::new(LineString::new(coords), Vec::new()));
        }

        match self.bbox.as_deref() {
            Some(&[w, s, e, n]) if w < e && s < n => Some(Polygon::new(
                LineString::from(vec![(w, s), (e, s), (e, n), (w, n), (w, s)]),
                Vec::new(),
            )),
            _ => None,
        }
    }
}
