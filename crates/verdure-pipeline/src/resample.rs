//! Resampling rasters between grids.
//!
//! Every destination cell center is mapped into the source grid (through
//! WGS84 when the coordinate systems differ) and sampled there. Cells
//! that map outside the source grid, or whose contributing source cells
//! are not all valid, come out invalid.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::raster::{GridSpec, MaskedGrid};
use crate::types::PipelineError;

/// Fractional positions this close to a cell center snap onto it, so an
/// identity resample reproduces the source exactly.
const CENTER_SNAP: f64 = 1e-9;

/// Bilinear weights at or below this do not count as contributing.
const MIN_WEIGHT: f64 = 1e-12;

/// Interpolation used when resampling values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    /// Value of the source cell containing the destination center.
    Nearest,
    /// Distance-weighted blend of the four surrounding source centers.
    #[default]
    Bilinear,
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("nearest"),
            Self::Bilinear => f.write_str("bilinear"),
        }
    }
}

/// Resample `grid`, laid out on `src`, onto `dst`.
///
/// A bilinear cell is valid only when every source cell with a non-zero
/// weight is valid.
///
/// # Errors
///
/// - [`PipelineError::GridMismatch`] if `grid` does not have `src`'s shape.
/// - [`PipelineError::InvalidConfig`] if the two coordinate systems
///   differ and one of them cannot be reprojected.
pub fn resample(
    grid: &MaskedGrid,
    src: &GridSpec,
    dst: &GridSpec,
    method: ResampleMethod,
) -> Result<MaskedGrid, PipelineError> {
    check_shape(grid.dim(), src)?;

    let mut values = Array2::zeros(dst.shape());
    let mut valid = Array2::from_elem(dst.shape(), false);

    for row in 0..dst.rows {
        for col in 0..dst.cols {
            let (col_f, row_f) = source_position(src, dst, row, col)?;
            let sample = match method {
                ResampleMethod::Nearest => sample_nearest(grid, src, col_f, row_f),
                ResampleMethod::Bilinear => sample_bilinear(grid, src, col_f, row_f),
            };
            if let Some(v) = sample {
                values[[row, col]] = v;
                valid[[row, col]] = true;
            }
        }
    }

    MaskedGrid::new(values, valid)
}

/// Nearest-neighbour resample of a categorical array (e.g. quality
/// classes). Destination cells outside the source get `fill`.
///
/// # Errors
///
/// Same as [`resample`].
pub fn resample_nearest<T: Copy>(
    values: &Array2<T>,
    src: &GridSpec,
    dst: &GridSpec,
    fill: T,
) -> Result<Array2<T>, PipelineError> {
    check_shape(values.dim(), src)?;

    let mut out = Array2::from_elem(dst.shape(), fill);
    for row in 0..dst.rows {
        for col in 0..dst.cols {
            let (col_f, row_f) = source_position(src, dst, row, col)?;
            if let Some((r, c)) = containing_cell(src, col_f, row_f) {
                out[[row, col]] = values[[r, c]];
            }
        }
    }
    Ok(out)
}

/// Grid in `target` covering the same ground as `src` with the same
/// number of cells.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the extent cannot be
/// transformed.
pub fn reprojected_spec(src: &GridSpec, target: Crs) -> Result<GridSpec, PipelineError> {
    if src.crs == target {
        return Ok(*src);
    }
    let extent = src.crs.transform_extent(target, &src.extent())?;
    #[allow(clippy::cast_precision_loss)]
    let resolution = (
        extent.width() / src.cols.max(1) as f64,
        extent.height() / src.rows.max(1) as f64,
    );
    Ok(GridSpec::covering(target, &extent, resolution))
}

fn check_shape(dim: (usize, usize), spec: &GridSpec) -> Result<(), PipelineError> {
    if dim == spec.shape() {
        Ok(())
    } else {
        Err(PipelineError::GridMismatch {
            reason: format!(
                "array {}x{} vs grid {}x{}",
                dim.0, dim.1, spec.rows, spec.cols
            ),
        })
    }
}

/// Fractional `(col, row)` in `src` of the center of `dst` cell `(row, col)`.
fn source_position(
    src: &GridSpec,
    dst: &GridSpec,
    row: usize,
    col: usize,
) -> Result<(f64, f64), PipelineError> {
    let (x, y) = dst.transform.pixel_center(row, col);
    let (sx, sy) = dst.crs.transform(src.crs, x, y)?;
    Ok(src.transform.geo_to_pixel(sx, sy))
}

#[allow(clippy::cast_precision_loss)]
fn inside(src: &GridSpec, col_f: f64, row_f: f64) -> bool {
    (0.0..src.cols as f64).contains(&col_f) && (0.0..src.rows as f64).contains(&row_f)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn containing_cell(src: &GridSpec, col_f: f64, row_f: f64) -> Option<(usize, usize)> {
    inside(src, col_f, row_f).then(|| (row_f.floor() as usize, col_f.floor() as usize))
}

fn sample_nearest(grid: &MaskedGrid, src: &GridSpec, col_f: f64, row_f: f64) -> Option<f64> {
    let (r, c) = containing_cell(src, col_f, row_f)?;
    grid.get(r, c)
}

fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < CENTER_SNAP {
        rounded
    } else {
        v
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn sample_bilinear(grid: &MaskedGrid, src: &GridSpec, col_f: f64, row_f: f64) -> Option<f64> {
    if !inside(src, col_f, row_f) {
        return None;
    }

    // Position relative to cell centers, clamped so edge cells replicate.
    let fx = snap(col_f - 0.5).clamp(0.0, (src.cols - 1) as f64);
    let fy = snap(row_f - 0.5).clamp(0.0, (src.rows - 1) as f64);

    let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(src.cols - 1), (y0 + 1).min(src.rows - 1));
    let (wx, wy) = (fx - x0 as f64, fy - y0 as f64);

    let taps = [
        (y0, x0, (1.0 - wx) * (1.0 - wy)),
        (y0, x1, wx * (1.0 - wy)),
        (y1, x0, (1.0 - wx) * wy),
        (y1, x1, wx * wy),
    ];

    let mut sum = 0.0;
    for (r, c, w) in taps {
        if w <= MIN_WEIGHT {
            continue;
        }
        sum += w * grid.get(r, c)?;
    }
    Some(sum)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;
    use crate::raster::GeoTransform;

    fn spec(origin: (f64, f64), pixel: f64, rows: usize, cols: usize) -> GridSpec {
        GridSpec::new(
            Crs::EqualArea,
            GeoTransform::new(origin.0, origin.1, pixel, -pixel),
            rows,
            cols,
        )
    }

    #[test]
    fn default_method_is_bilinear() {
        assert_eq!(ResampleMethod::default(), ResampleMethod::Bilinear);
        assert_eq!(ResampleMethod::Nearest.to_string(), "nearest");
    }

    #[test]
    fn identity_resample_reproduces_source() {
        let s = spec((0.0, 30.0), 10.0, 3, 3);
        let grid = MaskedGrid::new(
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]],
            array![[true, true, true], [true, false, true], [true, true, true]],
        )
        .unwrap();
        for method in [ResampleMethod::Nearest, ResampleMethod::Bilinear] {
            let out = resample(&grid, &s, &s, method).unwrap();
            assert_eq!(out, grid, "{method}");
        }
    }

    #[test]
    fn bilinear_blends_four_neighbours() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let dst = spec((0.0, 20.0), 20.0, 1, 1);
        let grid = MaskedGrid::all_valid(array![[0.0, 1.0], [2.0, 3.0]]);
        let out = resample(&grid, &src, &dst, ResampleMethod::Bilinear).unwrap();
        assert_abs_diff_eq!(out.get(0, 0).unwrap(), 1.5);
    }

    #[test]
    fn bilinear_invalid_contributor_invalidates() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let dst = spec((0.0, 20.0), 20.0, 1, 1);
        let grid = MaskedGrid::new(
            array![[0.0, 1.0], [2.0, 3.0]],
            array![[true, true], [true, false]],
        )
        .unwrap();
        let out = resample(&grid, &src, &dst, ResampleMethod::Bilinear).unwrap();
        assert_eq!(out.valid_count(), 0);
    }

    #[test]
    fn nearest_picks_containing_cell() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let dst = spec((0.0, 20.0), 5.0, 4, 4);
        let grid = MaskedGrid::all_valid(array![[0.0, 1.0], [2.0, 3.0]]);
        let out = resample(&grid, &src, &dst, ResampleMethod::Nearest).unwrap();
        assert_eq!(out.get(0, 0), Some(0.0));
        assert_eq!(out.get(0, 3), Some(1.0));
        assert_eq!(out.get(3, 0), Some(2.0));
        assert_eq!(out.get(3, 3), Some(3.0));
    }

    #[test]
    fn outside_source_is_invalid() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let dst = spec((10.0, 20.0), 10.0, 2, 2);
        let grid = MaskedGrid::all_valid(array![[0.0, 1.0], [2.0, 3.0]]);
        let out = resample(&grid, &src, &dst, ResampleMethod::Bilinear).unwrap();
        assert_eq!(out.get(0, 0), Some(1.0));
        assert_eq!(out.get(0, 1), None);
        assert_eq!(out.valid_count(), 2);
    }

    #[test]
    fn categorical_nearest_uses_fill_outside() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let dst = spec((10.0, 20.0), 10.0, 1, 2);
        let classes = array![[1_u8, 2], [3, 4]];
        let out = resample_nearest(&classes, &src, &dst, 0).unwrap();
        assert_eq!(out, array![[2_u8, 0]]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let src = spec((0.0, 20.0), 10.0, 2, 2);
        let grid = MaskedGrid::all_valid(Array2::zeros((3, 3)));
        assert!(matches!(
            resample(&grid, &src, &src, ResampleMethod::Nearest),
            Err(PipelineError::GridMismatch { .. })
        ));
    }

    #[test]
    fn reprojected_spec_keeps_cell_count() {
        let wgs = GridSpec::new(
            Crs::Wgs84,
            GeoTransform::new(-104.0, 44.0, 0.01, -0.01),
            10,
            10,
        );
        let utm = Crs::utm_for(-103.95, 43.95);
        let out = reprojected_spec(&wgs, utm).unwrap();
        assert_eq!(out.crs, utm);
        assert_eq!(out.shape(), (10, 10));
        let (rx, ry) = out.resolution();
        // 0.01 degree is roughly 800 m east-west and 1100 m north-south here.
        assert!(rx > 700.0 && rx < 900.0, "{rx}");
        assert!(ry > 1000.0 && ry < 1200.0, "{ry}");
    }

    #[test]
    fn reprojected_round_trip_resample_keeps_values() {
        let wgs = GridSpec::new(
            Crs::Wgs84,
            GeoTransform::new(-104.0, 44.0, 0.01, -0.01),
            10,
            10,
        );
        let grid = MaskedGrid::all_valid(Array2::from_elem((10, 10), 0.42));
        let utm = reprojected_spec(&wgs, Crs::utm_for(-103.95, 43.95)).unwrap();
        let out = resample(&grid, &wgs, &utm, ResampleMethod::Bilinear).unwrap();
        assert!(out.valid_count() > 50);
        for v in out.values().iter().zip(out.valid()).filter(|(_, ok)| **ok).map(|(v, _)| *v) {
            assert_abs_diff_eq!(v, 0.42, epsilon = 1e-12);
        }
    }
}
