//! Best-observation merge of several index rasters for one year.
//!
//! Inputs arrive best first (ascending cloud cover). The first raster's
//! grid is the output grid; every other raster is resampled onto it. Each
//! cell takes the first valid observation in input order, so a clearer
//! scene always wins over a cloudier one.

use ndarray::Zip;

use crate::raster::{IndexRaster, MaskedGrid};
use crate::resample::{ResampleMethod, resample};
use crate::types::PipelineError;

/// Merge `rasters` per cell, first valid wins.
///
/// The result keeps the primary raster's grid and acquisition date and
/// lists every contributing scene, primary first. A single input is
/// returned as is.
///
/// # Errors
///
/// - [`PipelineError::InvalidConfig`] for an empty input.
/// - Any error from resampling a secondary raster onto the primary grid.
pub fn mosaic(rasters: Vec<IndexRaster>) -> Result<IndexRaster, PipelineError> {
    let mut iter = rasters.into_iter();
    let Some(primary) = iter.next() else {
        return Err(PipelineError::InvalidConfig(
            "mosaic needs at least one raster".to_string(),
        ));
    };

    let spec = primary.spec;
    let mut values = primary.grid.values().clone();
    let mut valid = primary.grid.valid().clone();
    let mut scenes = primary.scenes;

    for secondary in iter {
        let grid = if secondary.spec.same_grid(&spec) {
            secondary.grid
        } else {
            resample(&secondary.grid, &secondary.spec, &spec, ResampleMethod::Bilinear)?
        };

        let mut filled = 0_usize;
        Zip::from(&mut values)
            .and(&mut valid)
            .and(grid.values())
            .and(grid.valid())
            .for_each(|v, ok, &sv, &s_ok| {
                if !*ok && s_ok {
                    *v = sv;
                    *ok = true;
                    filled += 1;
                }
            });
        tracing::debug!(scenes = ?secondary.scenes, filled, "merged secondary scene");
        scenes.extend(secondary.scenes);
    }

    Ok(IndexRaster {
        spec,
        grid: MaskedGrid::new(values, valid)?,
        acquired: primary.acquired,
        cloud_cover: primary.cloud_cover,
        scenes,
    })
}
