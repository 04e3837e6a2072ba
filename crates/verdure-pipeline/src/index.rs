//! Normalized-difference vegetation index.
//!
//! `index = (nir - red) / (nir + red)` per cell, computed row-parallel.
//! A cell is invalid when either band is invalid or the denominator is
//! (numerically) zero. Results are clamped to `[-1, 1]`: negative
//! reflectance noise can push a valid division outside the range, and
//! such cells are kept at the bound rather than discarded.

use ndarray::Array2;
use rayon::prelude::*;

use crate::raster::{IndexRaster, MaskedGrid, SpectralRaster};
use crate::types::PipelineError;

/// Denominators with an absolute value below this are treated as zero.
pub const DENOMINATOR_EPSILON: f64 = 1e-10;

/// Index value of one cell, or `None` when undefined.
#[must_use]
pub fn normalized_difference(nir: f64, red: f64) -> Option<f64> {
    let sum = nir + red;
    if !sum.is_finite() || sum.abs() < DENOMINATOR_EPSILON {
        return None;
    }
    let value = (nir - red) / sum;
    value.is_finite().then(|| value.clamp(-1.0, 1.0))
}

/// Compute the vegetation index from two bands on the same grid.
///
/// The result carries `nir`'s grid, acquisition date and scene id.
///
/// # Errors
///
/// Returns [`PipelineError::GridMismatch`] when the bands differ in CRS,
/// transform, or shape.
pub fn compute_index(nir: &SpectralRaster, red: &SpectralRaster) -> Result<IndexRaster, PipelineError> {
    if let Some(reason) = nir.spec.mismatch(&red.spec) {
        return Err(PipelineError::GridMismatch { reason });
    }
    if nir.grid.dim() != red.grid.dim() || nir.grid.dim() != nir.spec.shape() {
        return Err(PipelineError::GridMismatch {
            reason: "pixel array does not match grid".to_string(),
        });
    }

    let (rows, cols) = nir.spec.shape();
    let cells: Vec<Option<f64>> = (0..rows)
        .into_par_iter()
        .flat_map_iter(|row| {
            (0..cols).map(move |col| {
                let a = nir.grid.get(row, col)?;
                let b = red.grid.get(row, col)?;
                normalized_difference(a, b)
            })
        })
        .collect();

    let to_grid_err = |e: ndarray::ShapeError| PipelineError::GridMismatch {
        reason: e.to_string(),
    };
    let values = Array2::from_shape_vec((rows, cols), cells.iter().map(|c| c.unwrap_or(0.0)).collect())
        .map_err(to_grid_err)?;
    let valid = Array2::from_shape_vec((rows, cols), cells.iter().map(Option::is_some).collect())
        .map_err(to_grid_err)?;
    let grid = MaskedGrid::new(values, valid)?;

    tracing::debug!(
        scene = %nir.scene.id,
        valid = grid.valid_count(),
        cells = rows * cols,
        "computed vegetation index"
    );

    Ok(IndexRaster {
        spec: nir.spec,
        grid,
        acquired: nir.scene.acquired,
        cloud_cover: nir.scene.cloud_cover,
        scenes: vec![nir.scene.id.clone()],
    })
}
