//! Point sampling of a change map.
//!
//! Points come from a Halton low-discrepancy sequence (bases 2 and 3) over
//! the area's bounding box, keeping those that fall inside the polygon.
//! The same area, count and seed always give the same points.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::aoi::AreaOfInterest;
use crate::classify::{ChangeClass, ChangeMap};
use crate::raster::IndexRaster;
use crate::types::PipelineError;

/// Rejection-sampling budget per requested point.
const ATTEMPTS_PER_POINT: usize = 10;

/// Absolute change above which a sample is listed as significant.
pub const SIGNIFICANT_SAMPLE_DELTA: f64 = 0.1;

/// Before/after values at one sampled location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSample {
    /// Longitude of the sample.
    pub lon: f64,
    /// Latitude of the sample.
    pub lat: f64,
    /// Grid row containing the sample.
    pub row: usize,
    /// Grid column containing the sample.
    pub col: usize,
    /// Index value in the earlier acquisition.
    pub before: f64,
    /// Index value in the later acquisition.
    pub after: f64,
    /// `after - before`.
    pub delta: f64,
    /// Change class of the cell.
    pub class: ChangeClass,
    /// Acquisition date of the earlier primary scene.
    pub start_date: NaiveDate,
    /// Acquisition date of the later primary scene.
    pub end_date: NaiveDate,
    /// Cloud cover fraction of the earlier primary scene.
    pub start_cloud: f64,
    /// Cloud cover fraction of the later primary scene.
    pub end_cloud: f64,
}

/// `i`-th element of the van der Corput sequence in `base`.
#[allow(clippy::cast_precision_loss)]
fn radical_inverse(mut i: u64, base: u64) -> f64 {
    let inv_base = 1.0 / base as f64;
    let mut factor = inv_base;
    let mut result = 0.0;
    while i > 0 {
        result += (i % base) as f64 * factor;
        i /= base;
        factor *= inv_base;
    }
    result
}

/// Up to `n` lon/lat points inside `aoi`.
///
/// Draws at most `10 n` candidates, so a very thin polygon may yield
/// fewer than `n` points. `seed` selects the offset into the sequence.
#[must_use]
pub fn sample_points(aoi: &AreaOfInterest, n: usize, seed: u64) -> Vec<(f64, f64)> {
    let bbox = aoi.bounding_box();
    let mut points = Vec::with_capacity(n);
    let budget = n.saturating_mul(ATTEMPTS_PER_POINT) as u64;

    for k in 0..budget {
        if points.len() == n {
            break;
        }
        // Index 0 maps to the corner; start at 1.
        let i = seed.wrapping_add(k).wrapping_add(1);
        let lon = radical_inverse(i, 2).mul_add(bbox.width(), bbox.min_x);
        let lat = radical_inverse(i, 3).mul_add(bbox.height(), bbox.min_y);
        if aoi.contains(lon, lat) {
            points.push((lon, lat));
        }
    }
    points
}

/// Read the change at each lon/lat point.
///
/// Points outside the grid, or on cells invalid in either acquisition,
/// are skipped. `before` and `after` must be the aligned rasters `map` was
/// built from.
///
/// # Errors
///
/// - [`PipelineError::GridMismatch`] if a raster is not on `map`'s grid.
/// - [`PipelineError::InvalidConfig`] if the map's CRS cannot be projected into.
pub fn sample_change(
    map: &ChangeMap,
    before: &IndexRaster,
    after: &IndexRaster,
    points: &[(f64, f64)],
) -> Result<Vec<PointSample>, PipelineError> {
    for raster in [before, after] {
        if let Some(reason) = map.spec.mismatch(&raster.spec) {
            return Err(PipelineError::GridMismatch { reason });
        }
    }

    let mut samples = Vec::with_capacity(points.len());
    for &(lon, lat) in points {
        let (x, y) = map.spec.crs.from_wgs84(lon, lat)?;
        let (col_f, row_f) = map.spec.transform.geo_to_pixel(x, y);
        if col_f < 0.0 || row_f < 0.0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (row, col) = (row_f.floor() as usize, col_f.floor() as usize);

        let (Some(delta), Some(b), Some(a), Some(class)) = (
            map.delta.get(row, col),
            before.grid.get(row, col),
            after.grid.get(row, col),
            map.class_at(row, col),
        ) else {
            continue;
        };
        samples.push(PointSample {
            lon,
            lat,
            row,
            col,
            before: b,
            after: a,
            delta,
            class,
            start_date: map.before_date,
            end_date: map.after_date,
            start_cloud: before.cloud_cover,
            end_cloud: after.cloud_cover,
        });
    }
    Ok(samples)
}

/// Samples whose absolute change exceeds `min_abs_delta`, strongest loss
/// first.
#[must_use]
pub fn significant_samples(samples: &[PointSample], min_abs_delta: f64) -> Vec<PointSample> {
    let mut picked: Vec<PointSample> = samples
        .iter()
        .filter(|s| s.delta.abs() > min_abs_delta)
        .cloned()
        .collect();
    picked.sort_by(|a, b| a.delta.total_cmp(&b.delta));
    picked
}
