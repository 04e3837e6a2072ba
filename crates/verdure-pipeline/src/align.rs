//! Temporal alignment: put the before and after index rasters on one grid.

use crate::raster::{GridSpec, IndexRaster};
use crate::resample::{ResampleMethod, reprojected_spec, resample};
use crate::types::PipelineError;

/// Two index rasters on an identical grid.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPair {
    /// Earlier acquisition.
    pub before: IndexRaster,
    /// Later acquisition.
    pub after: IndexRaster,
    /// Whether any resampling took place.
    pub resampled: bool,
}

/// Bring `before` and `after` onto a shared grid.
///
/// Rasters already sharing a grid are returned untouched. Otherwise the
/// coarser raster is the reference (ties favour `before`): the output
/// grid is its lattice, cropped to the overlap of the two extents, and
/// both inputs are bilinearly resampled onto it. A resampled cell is valid
/// only if every contributing source cell was.
///
/// # Errors
///
/// - [`PipelineError::NoOverlap`] if the rasters do not intersect.
/// - [`PipelineError::InvalidConfig`] if the coordinate systems differ and
///   one cannot be reprojected.
pub fn align(before: IndexRaster, after: IndexRaster) -> Result<AlignedPair, PipelineError> {
    if before.spec.same_grid(&after.spec) {
        return Ok(AlignedPair {
            before,
            after,
            resampled: false,
        });
    }

    let reference = if is_coarser(&after.spec, &before.spec)? {
        after.spec
    } else {
        before.spec
    };
    let grid = shared_grid(&reference, &before.spec, &after.spec)?;

    tracing::debug!(
        crs = %grid.crs,
        rows = grid.rows,
        cols = grid.cols,
        "aligning index rasters onto shared grid"
    );

    let before = onto(before, &grid)?;
    let after = onto(after, &grid)?;
    Ok(AlignedPair {
        before,
        after,
        resampled: true,
    })
}

/// Whether `a` has strictly larger cells than `b`, measured in `b`'s CRS.
fn is_coarser(a: &GridSpec, b: &GridSpec) -> Result<bool, PipelineError> {
    let a_in_b = reprojected_spec(a, b.crs)?;
    let b_area = b.pixel_area();
    Ok(a_in_b.pixel_area() > b_area * (1.0 + 1e-9))
}

/// The reference lattice cropped to where both rasters overlap.
fn shared_grid(
    reference: &GridSpec,
    a: &GridSpec,
    b: &GridSpec,
) -> Result<GridSpec, PipelineError> {
    let a_extent = a.crs.transform_extent(reference.crs, &a.extent())?;
    let b_extent = b.crs.transform_extent(reference.crs, &b.extent())?;
    let overlap = a_extent
        .intersection(&b_extent)
        .ok_or(PipelineError::NoOverlap)?;
    let window = reference
        .snapped_window(&overlap)
        .ok_or(PipelineError::NoOverlap)?;
    Ok(reference.window(window))
}

fn onto(raster: IndexRaster, grid: &GridSpec) -> Result<IndexRaster, PipelineError> {
    if raster.spec.same_grid(grid) {
        return Ok(raster);
    }
    let values = resample(&raster.grid, &raster.spec, grid, ResampleMethod::Bilinear)?;
    Ok(IndexRaster {
        spec: *grid,
        grid: values,
        ..raster
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    use super::*;
    use crate::crs::Crs;
    use crate::raster::{GeoTransform, MaskedGrid};
    use crate::testing::{date, index_raster};

    #[test]
    fn same_grid_is_returned_unchanged() {
        let a = index_raster("a", date(2018, 7, 1), array![[0.1, 0.2], [0.3, 0.4]]);
        let b = index_raster("b", date(2023, 7, 1), array![[0.5, 0.6], [0.7, 0.8]]);
        let pair = align(a.clone(), b.clone()).unwrap();
        assert!(!pair.resampled);
        assert_eq!(pair.before, a);
        assert_eq!(pair.after, b);
    }

    #[test]
    fn coarser_raster_sets_resolution() {
        let fine = index_raster("fine", date(2018, 7, 1), Array2::from_elem((4, 4), 0.2));
        let mut coarse = index_raster("coarse", date(2023, 7, 1), Array2::from_elem((2, 2), 0.6));
        coarse.spec.transform.pixel_width *= 2.0;
        coarse.spec.transform.pixel_height *= 2.0;

        let pair = align(fine, coarse.clone()).unwrap();
        assert!(pair.resampled);
        assert!(pair.before.spec.same_grid(&pair.after.spec));
        assert!(pair.after.spec.same_grid(&coarse.spec));
        assert_eq!(pair.after, coarse);
        assert_eq!(pair.before.grid.valid_count(), 4);
        assert_abs_diff_eq!(pair.before.grid.get(1, 1).unwrap(), 0.2, epsilon = 1e-12);
        assert_eq!(pair.before.scenes, ["fine"]);
    }

    #[test]
    fn crops_to_overlap() {
        let a = index_raster("a", date(2018, 7, 1), Array2::from_elem((4, 4), 0.2));
        let mut b = index_raster("b", date(2023, 7, 1), Array2::from_elem((4, 4), 0.4));
        let t = b.spec.transform;
        b.spec.transform = GeoTransform::new(
            2.0f64.mul_add(t.pixel_width, t.origin_x),
            t.origin_y,
            t.pixel_width,
            t.pixel_height,
        );
        let pair = align(a, b).unwrap();
        assert_eq!(pair.before.spec.shape(), (4, 2));
        assert_eq!(pair.before.grid.valid_count(), 8);
        assert_eq!(pair.after.grid.valid_count(), 8);
    }

    #[test]
    fn disjoint_rasters_do_not_overlap() {
        let a = index_raster("a", date(2018, 7, 1), Array2::from_elem((2, 2), 0.2));
        let mut b = index_raster("b", date(2023, 7, 1), Array2::from_elem((2, 2), 0.4));
        b.spec.transform.origin_x += 10.0;
        assert_eq!(align(a, b).unwrap_err(), PipelineError::NoOverlap);
    }

    #[test]
    fn validity_survives_resampling_as_logical_and() {
        let a = index_raster("a", date(2018, 7, 1), Array2::from_elem((4, 4), 0.2));
        let mut b = index_raster("b", date(2023, 7, 1), Array2::from_elem((4, 4), 0.4));
        b.grid = MaskedGrid::new(Array2::from_elem((4, 4), 0.4), {
            let mut valid = Array2::from_elem((4, 4), true);
            valid[[0, 0]] = false;
            valid
        })
        .unwrap();
        // Half-cell shift forces real interpolation.
        b.spec.transform.origin_x += b.spec.transform.pixel_width / 2.0;
        let pair = align(a, b).unwrap();
        let after = &pair.after;
        // Cells interpolating from the invalid corner are invalid.
        assert_eq!(after.grid.get(0, 0), None);
        assert!(after.grid.valid_count() < after.spec.len());
        assert!(after.grid.valid_count() > 0);
    }

    #[test]
    fn different_crs_are_reprojected() {
        let a = index_raster("a", date(2018, 7, 1), Array2::from_elem((10, 10), 0.3));
        let utm = Crs::utm_for(-103.95, 43.95);
        let b_spec = reprojected_spec(&a.spec, utm).unwrap();
        let b = IndexRaster {
            spec: b_spec,
            grid: MaskedGrid::all_valid(Array2::from_elem(b_spec.shape(), 0.7)),
            acquired: date(2023, 7, 1),
            cloud_cover: 0.1,
            scenes: vec!["b".to_string()],
        };
        let pair = align(a, b).unwrap();
        assert!(pair.before.spec.same_grid(&pair.after.spec));
        assert!(pair.after.grid.valid_count() > 0);
    }
}
