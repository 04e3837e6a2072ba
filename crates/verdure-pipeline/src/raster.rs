//! Georeferenced raster grids.
//!
//! A [`GridSpec`] ties a pixel grid to the ground: coordinate reference
//! system, a north-up affine [`GeoTransform`], and dimensions. Pixel data
//! lives in a [`MaskedGrid`], a value array paired with a validity mask
//! of the same shape. Invalid cells always hold `0.0` so that no NaN
//! propagates through arithmetic. The mask is what downstream stages
//! consult.

use chrono::NaiveDate;
use ndarray::{Array2, Zip, s};
use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::types::{Band, PipelineError};

/// Relative tolerance used when comparing grid geometry.
const GEOMETRY_TOLERANCE: f64 = 1e-9;

/// North-up affine transform from pixel to CRS coordinates.
///
/// ```text
/// x = origin_x + col * pixel_width
/// y = origin_y + row * pixel_height
/// ```
///
/// `pixel_height` is negative for north-up rasters, following the GDAL
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner.
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner.
    pub origin_y: f64,
    /// Cell size along x (positive).
    pub pixel_width: f64,
    /// Cell size along y (negative for north-up).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Create a north-up transform.
    #[must_use]
    pub const fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Build from GDAL-style coefficients
    /// `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`.
    ///
    /// Returns `None` for rotated or degenerate transforms, which the
    /// pipeline does not support.
    #[must_use]
    pub fn from_gdal(coeffs: [f64; 6]) -> Option<Self> {
        let [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height] = coeffs;
        let north_up = row_rotation.abs() < f64::EPSILON && col_rotation.abs() < f64::EPSILON;
        let sized = pixel_width > 0.0 && pixel_height < 0.0;
        let finite = coeffs.iter().all(|c| c.is_finite());
        (north_up && sized && finite)
            .then(|| Self::new(origin_x, origin_y, pixel_width, pixel_height))
    }

    /// GDAL-style coefficients.
    #[must_use]
    pub const fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    /// CRS coordinates of the center of cell `(row, col)`.
    #[must_use]
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        #[allow(clippy::cast_precision_loss)]
        let (row_f, col_f) = (row as f64 + 0.5, col as f64 + 0.5);
        (
            col_f.mul_add(self.pixel_width, self.origin_x),
            row_f.mul_add(self.pixel_height, self.origin_y),
        )
    }

    /// Fractional `(col, row)` position of a CRS coordinate, measured
    /// from the upper-left corner of the grid.
    #[must_use]
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    /// Absolute cell size `(x, y)`.
    #[must_use]
    pub const fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }

    /// Whether two transforms describe the same lattice, within a
    /// tolerance relative to the cell size.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        let tol_x = self.pixel_width.abs() * GEOMETRY_TOLERANCE;
        let tol_y = self.pixel_height.abs() * GEOMETRY_TOLERANCE;
        (self.origin_x - other.origin_x).abs() <= tol_x
            && (self.origin_y - other.origin_y).abs() <= tol_y
            && (self.pixel_width - other.pixel_width).abs() <= tol_x
            && (self.pixel_height - other.pixel_height).abs() <= tol_y
    }
}

/// Axis-aligned bounding box in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    /// Western bound.
    pub min_x: f64,
    /// Southern bound.
    pub min_y: f64,
    /// Eastern bound.
    pub max_x: f64,
    /// Northern bound.
    pub max_y: f64,
}

impl Extent {
    /// Create an extent from its bounds.
    #[must_use]
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Width along x.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height along y.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Overlapping region, or `None` when the extents only touch or are
    /// disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let result = Self::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (result.min_x < result.max_x && result.min_y < result.max_y).then_some(result)
    }
}

/// Rectangular block of cells inside a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// First row.
    pub row: usize,
    /// First column.
    pub col: usize,
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

/// Geometry of a raster: CRS, transform, and dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Coordinate reference system of the transform.
    pub crs: Crs,
    /// Pixel-to-CRS transform.
    pub transform: GeoTransform,
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl GridSpec {
    /// Create a grid description.
    #[must_use]
    pub const fn new(crs: Crs, transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self {
            crs,
            transform,
            rows,
            cols,
        }
    }

    /// Smallest grid with the given cell size whose upper-left corner is
    /// the upper-left corner of `extent` and which covers all of it.
    #[must_use]
    pub fn covering(crs: Crs, extent: &Extent, resolution: (f64, f64)) -> Self {
        let (res_x, res_y) = resolution;
        let cols = cell_count(extent.width(), res_x);
        let rows = cell_count(extent.height(), res_y);
        Self::new(
            crs,
            GeoTransform::new(extent.min_x, extent.max_y, res_x, -res_y),
            rows,
            cols,
        )
    }

    /// `(rows, cols)`, matching `ndarray` shape order.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of cells.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the grid has no cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Ground footprint of the grid.
    #[must_use]
    pub fn extent(&self) -> Extent {
        let t = &self.transform;
        #[allow(clippy::cast_precision_loss)]
        let (w, h) = (self.cols as f64 * t.pixel_width, self.rows as f64 * t.pixel_height);
        Extent::new(t.origin_x, t.origin_y + h, t.origin_x + w, t.origin_y)
    }

    /// Absolute cell size `(x, y)` in CRS units.
    #[must_use]
    pub const fn resolution(&self) -> (f64, f64) {
        self.transform.resolution()
    }

    /// Area of one cell in squared CRS units.
    #[must_use]
    pub const fn pixel_area(&self) -> f64 {
        let (x, y) = self.resolution();
        x * y
    }

    /// Same CRS, same transform (within tolerance), same dimensions.
    #[must_use]
    pub fn same_grid(&self, other: &Self) -> bool {
        self.crs == other.crs
            && self.rows == other.rows
            && self.cols == other.cols
            && self.transform.approx_eq(&other.transform)
    }

    /// Short description of the first property that differs from `other`.
    #[must_use]
    pub fn mismatch(&self, other: &Self) -> Option<String> {
        if self.crs != other.crs {
            Some(format!("crs {} vs {}", self.crs, other.crs))
        } else if self.shape() != other.shape() {
            Some(format!(
                "shape {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            ))
        } else if !self.transform.approx_eq(&other.transform) {
            Some("transform differs".to_string())
        } else {
            None
        }
    }

    /// Sub-grid covering `window`.
    #[must_use]
    pub fn window(&self, window: Window) -> Self {
        let t = &self.transform;
        #[allow(clippy::cast_precision_loss)]
        let (dx, dy) = (window.col as f64, window.row as f64);
        Self::new(
            self.crs,
            GeoTransform::new(
                dx.mul_add(t.pixel_width, t.origin_x),
                dy.mul_add(t.pixel_height, t.origin_y),
                t.pixel_width,
                t.pixel_height,
            ),
            window.rows,
            window.cols,
        )
    }

    /// Block of cells that overlap `extent`, clamped to the grid. The
    /// window boundary snaps outwards to whole cells.
    ///
    /// Returns `None` when no cell overlaps.
    #[must_use]
    pub fn snapped_window(&self, extent: &Extent) -> Option<Window> {
        let t = &self.transform;
        let (c0, r0) = t.geo_to_pixel(extent.min_x, extent.max_y);
        let (c1, r1) = t.geo_to_pixel(extent.max_x, extent.min_y);

        let col_start = snap_floor(c0.min(c1)).max(0.0);
        let row_start = snap_floor(r0.min(r1)).max(0.0);
        #[allow(clippy::cast_precision_loss)]
        let col_end = snap_ceil(c0.max(c1)).min(self.cols as f64);
        #[allow(clippy::cast_precision_loss)]
        let row_end = snap_ceil(r0.max(r1)).min(self.rows as f64);

        if !(col_start < col_end && row_start < row_end) {
            return None;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let window = Window {
            row: row_start as usize,
            col: col_start as usize,
            rows: (row_end - row_start) as usize,
            cols: (col_end - col_start) as usize,
        };
        Some(window)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cell_count(length: f64, resolution: f64) -> usize {
    (length / resolution - GEOMETRY_TOLERANCE).ceil().max(1.0) as usize
}

/// Floor that tolerates floating-point noise just below an integer.
fn snap_floor(v: f64) -> f64 {
    (v + GEOMETRY_TOLERANCE).floor()
}

/// Ceil that tolerates floating-point noise just above an integer.
fn snap_ceil(v: f64) -> f64 {
    (v - GEOMETRY_TOLERANCE).ceil()
}

/// Pixel values paired with a validity mask of identical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedGrid {
    values: Array2<f64>,
    valid: Array2<bool>,
}

impl MaskedGrid {
    /// Pair values with a validity mask.
    ///
    /// Non-finite values are marked invalid, and every invalid cell is
    /// zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::GridMismatch`] when the shapes differ.
    pub fn new(mut values: Array2<f64>, mut valid: Array2<bool>) -> Result<Self, PipelineError> {
        if values.dim() != valid.dim() {
            let (vr, vc) = values.dim();
            let (mr, mc) = valid.dim();
            return Err(PipelineError::GridMismatch {
                reason: format!("values {vr}x{vc} vs mask {mr}x{mc}"),
            });
        }
        Zip::from(&mut values).and(&mut valid).for_each(|v, ok| {
            if !v.is_finite() {
                *ok = false;
            }
            if !*ok {
                *v = 0.0;
            }
        });
        Ok(Self { values, valid })
    }

    /// Every finite value valid.
    #[must_use]
    pub fn all_valid(values: Array2<f64>) -> Self {
        let valid = values.mapv(f64::is_finite);
        let values = values.mapv(|v| if v.is_finite() { v } else { 0.0 });
        Self { values, valid }
    }

    /// A grid with no valid cell.
    #[must_use]
    pub fn invalid(rows: usize, cols: usize) -> Self {
        Self {
            values: Array2::zeros((rows, cols)),
            valid: Array2::from_elem((rows, cols), false),
        }
    }

    /// `(rows, cols)`.
    #[must_use]
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    /// Cell values. Invalid cells are `0.0`.
    #[must_use]
    pub const fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Validity mask.
    #[must_use]
    pub const fn valid(&self) -> &Array2<bool> {
        &self.valid
    }

    /// Value at a cell, or `None` when invalid or out of range.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self.valid.get((row, col)) {
            Some(true) => self.values.get((row, col)).copied(),
            _ => None,
        }
    }

    /// Number of valid cells.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Copy with additional cells invalidated where `mask` is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::GridMismatch`] when the mask shape differs.
    pub fn with_mask(&self, mask: &Array2<bool>) -> Result<Self, PipelineError> {
        if mask.dim() != self.dim() {
            let (r, c) = self.dim();
            let (mr, mc) = mask.dim();
            return Err(PipelineError::GridMismatch {
                reason: format!("grid {r}x{c} vs mask {mr}x{mc}"),
            });
        }
        let valid = Zip::from(&self.valid)
            .and(mask)
            .map_collect(|&a, &b| a && b);
        Self::new(self.values.clone(), valid)
    }

    /// Copy of the cells inside `window`.
    #[must_use]
    pub fn slice(&self, window: Window) -> Self {
        let rows = window.row..window.row + window.rows;
        let cols = window.col..window.col + window.cols;
        Self {
            values: self.values.slice(s![rows.clone(), cols.clone()]).to_owned(),
            valid: self.valid.slice(s![rows, cols]).to_owned(),
        }
    }
}

/// Identity of the scene a raster came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRef {
    /// Catalog identifier.
    pub id: String,
    /// Acquisition date.
    pub acquired: NaiveDate,
    /// Catalog cloud cover fraction.
    pub cloud_cover: f64,
}

/// One decoded, reprojected, clipped, and masked spectral band.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralRaster {
    /// Which band this is.
    pub band: Band,
    /// Grid geometry.
    pub spec: GridSpec,
    /// Reflectance values and validity.
    pub grid: MaskedGrid,
    /// Source scene.
    pub scene: SceneRef,
}

/// Per-pixel vegetation index for one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRaster {
    /// Grid geometry.
    pub spec: GridSpec,
    /// Index values in `[-1, 1]` and validity.
    pub grid: MaskedGrid,
    /// Acquisition date of the primary scene.
    pub acquired: NaiveDate,
    /// Catalog cloud cover fraction of the primary scene.
    pub cloud_cover: f64,
    /// Contributing scene identifiers, primary first.
    pub scenes: Vec<String>,
}

impl IndexRaster {
    /// Identifier of the primary (best-ranked) scene.
    #[must_use]
    pub fn primary_scene(&self) -> &str {
        self.scenes.first().map_or("", String::as_str)
    }
}
