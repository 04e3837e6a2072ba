//! Area-of-interest files.
//!
//! Accepted documents, all in WGS84 lon/lat:
//!
//! - a bare ring: `[[lon, lat], ...]`
//! - a GeoJSON `Polygon` geometry (outer ring only)
//! - a GeoJSON `Feature` with a `Polygon` geometry
//! - a GeoJSON `FeatureCollection`, using its first feature

use std::path::Path;

use serde_json::Value;
use verdure_pipeline::AreaOfInterest;

use crate::error::{IoError, Result};
use crate::read_json;

/// Read and validate an area of interest.
///
/// # Errors
///
/// [`IoError::Read`]/[`IoError::Json`] for an unreadable file,
/// [`IoError::UnsupportedAoi`] for an unrecognized document, and
/// [`IoError::Aoi`] when the polygon breaks an area invariant.
pub fn read_aoi(path: &Path) -> Result<AreaOfInterest> {
    let document: Value = read_json(path)?;
    parse_aoi(&document)
}

/// Interpret a parsed JSON document as an area of interest.
///
/// # Errors
///
/// See [`read_aoi`].
pub fn parse_aoi(document: &Value) -> Result<AreaOfInterest> {
    let ring = outer_ring(document)?;
    let vertices = ring
        .iter()
        .map(|vertex| match vertex.as_array().map(Vec::as_slice) {
            Some([lon, lat, ..]) => lon.as_f64().zip(lat.as_f64()),
            _ => None,
        })
        .collect::<Option<Vec<(f64, f64)>>>()
        .ok_or_else(|| IoError::UnsupportedAoi("vertices must be [lon, lat] pairs".to_string()))?;
    Ok(AreaOfInterest::new(&vertices)?)
}

fn outer_ring(document: &Value) -> Result<&Vec<Value>> {
    let unsupported = |what: &str| IoError::UnsupportedAoi(what.to_string());

    match document {
        Value::Array(ring) => Ok(ring),
        Value::Object(object) => match object.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => object
                .get("features")
                .and_then(Value::as_array)
                .and_then(|features| features.first())
                .ok_or_else(|| unsupported("feature collection has no feature"))
                .and_then(outer_ring),
            Some("Feature") => object
                .get("geometry")
                .ok_or_else(|| unsupported("feature has no geometry"))
                .and_then(outer_ring),
            Some("Polygon") => object
                .get("coordinates")
                .and_then(Value::as_array)
                .and_then(|rings| rings.first())
                .and_then(Value::as_array)
                .ok_or_else(|| unsupported("polygon has no outer ring")),
            Some(other) => Err(IoError::UnsupportedAoi(format!(
                "geometry type {other} (expected Polygon)"
            ))),
            None => Err(unsupported("object without a GeoJSON type")),
        },
        _ => Err(unsupported("expected a JSON array or GeoJSON object")),
    }
}
