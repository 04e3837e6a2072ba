//! Raster loading: fetch the two index bands of a scene, bring them onto
//! one grid clipped to the area of interest, and mask clouds.
//!
//! Steps, per scene:
//!
//! 1. Fetch NIR, red, and the scene quality mask through the
//!    [`AssetDecoder`], retrying transient failures. The fetches are
//!    independent and run concurrently when enabled.
//! 2. Pick the output grid: the coarser band's grid, reprojected into the
//!    target CRS, cropped to the area's projected bounding box.
//! 3. Resample both bands onto it (bilinear) and invalidate nodata,
//!    saturated, and out-of-polygon cells.
//! 4. Fail with [`PipelineError::ClipEmpty`] if nothing valid remains.
//! 5. Invalidate cloud and cloud-shadow cells from the quality flags
//!    (nearest-neighbour resampled). A fully clouded area is a legitimate
//!    outcome and yields an all-invalid raster, not an error.

use std::fmt;
use std::time::Duration;

use geo::{BoundingRect, Contains, Point, Polygon};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::aoi::AreaOfInterest;
use crate::crs::Crs;
use crate::raster::{Extent, GridSpec, MaskedGrid, SceneRef, SpectralRaster};
use crate::resample::{ResampleMethod, reprojected_spec, resample, resample_nearest};
use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
use crate::select::{AssetRef, SceneCandidate};
use crate::types::{Band, PipelineError};

/// Per-pixel quality flag reported by a decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelQuality {
    /// Usable observation.
    #[default]
    Clear,
    /// No observation at all.
    NoData,
    /// Saturated or defective detector.
    Saturated,
    /// Cloud (any probability class) or cirrus.
    Cloud,
    /// Shadow cast by a cloud.
    CloudShadow,
}

impl PixelQuality {
    /// Interpret a Sentinel-2 scene classification (SCL) code.
    #[must_use]
    pub const fn from_scl(code: u8) -> Self {
        match code {
            0 => Self::NoData,
            1 => Self::Saturated,
            3 => Self::CloudShadow,
            8..=10 => Self::Cloud,
            _ => Self::Clear,
        }
    }

    /// The sensor recorded a real measurement here.
    #[must_use]
    pub const fn is_observed(self) -> bool {
        !matches!(self, Self::NoData | Self::Saturated)
    }

    /// The measurement is not obscured by cloud or shadow.
    #[must_use]
    pub const fn is_clear(self) -> bool {
        !matches!(self, Self::Cloud | Self::CloudShadow)
    }

    /// Observed and clear.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        self.is_observed() && self.is_clear()
    }
}

/// One band as produced by the decoder, before any processing.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBand {
    /// Native grid of the asset.
    pub spec: GridSpec,
    /// Raw reflectance samples.
    pub values: Array2<f64>,
    /// Sentinel value marking missing samples.
    pub nodata: Option<f64>,
    /// Per-pixel flags, when the format carries them.
    pub quality: Option<Array2<PixelQuality>>,
}

/// A categorical quality mask asset (e.g. a scene classification layer).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMask {
    /// Native grid of the asset.
    pub spec: GridSpec,
    /// Per-pixel flags.
    pub classes: Array2<PixelQuality>,
}

/// Failure reported by an [`AssetDecoder`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fetch failed in a way that may succeed on retry.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// The asset format is not understood.
    #[error("unsupported format: {0}")]
    Unsupported(String),
    /// The asset is malformed.
    #[error("corrupt asset: {0}")]
    Corrupt(String),
}

impl Retryable for DecodeError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Fetches and decodes raster assets.
pub trait AssetDecoder: Sync {
    /// Decode one spectral band.
    ///
    /// # Errors
    ///
    /// See [`DecodeError`].
    fn decode_band(
        &self,
        asset: &AssetRef,
        band: Band,
        timeout: Duration,
    ) -> Result<DecodedBand, DecodeError>;

    /// Decode a quality mask.
    ///
    /// # Errors
    ///
    /// See [`DecodeError`].
    fn decode_mask(&self, asset: &AssetRef, timeout: Duration) -> Result<DecodedMask, DecodeError>;
}

/// Coordinate system the loaded rasters are expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCrs {
    /// The scene's own CRS as reported by the catalog.
    #[default]
    Native,
    /// A fixed CRS, e.g. [`Crs::EqualArea`] for area statistics.
    Epsg(Crs),
}

impl TargetCrs {
    /// Resolve against a scene.
    #[must_use]
    pub const fn resolve(self, native: Crs) -> Crs {
        match self {
            Self::Native => native,
            Self::Epsg(crs) => crs,
        }
    }
}

impl fmt::Display for TargetCrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Epsg(crs) => write!(f, "{crs}"),
        }
    }
}

/// Catalog asset keys for each input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandAssets {
    /// Near-infrared band.
    pub nir: String,
    /// Red band.
    pub red: String,
    /// Scene quality mask. `None` skips scene-level cloud masking.
    pub mask: Option<String>,
}

impl Default for BandAssets {
    fn default() -> Self {
        Self {
            nir: "nir".to_string(),
            red: "red".to_string(),
            mask: Some("scl".to_string()),
        }
    }
}

impl BandAssets {
    /// Asset key configured for `band`.
    #[must_use]
    pub fn key(&self, band: Band) -> &str {
        match band {
            Band::Nir => &self.nir,
            Band::Red => &self.red,
        }
    }
}

/// Raster loader options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Output coordinate system.
    pub target_crs: TargetCrs,
    /// Asset keys.
    pub assets: BandAssets,
}

/// Both bands of one scene on a shared grid.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedScene {
    /// Near-infrared band.
    pub nir: SpectralRaster,
    /// Red band. Same grid as `nir`.
    pub red: SpectralRaster,
    /// Cells valid in both bands after clipping, before cloud masking.
    pub clipped_pixels: usize,
    /// Cells of `clipped_pixels` removed by the cloud mask.
    pub cloud_masked_pixels: usize,
}

/// Load NIR and red for `scene`, clipped to `aoi` and cloud-masked.
///
/// # Errors
///
/// - [`PipelineError::BandUnavailable`] if the scene lacks a band asset.
/// - [`PipelineError::FetchUnavailable`] if a fetch kept failing transiently.
/// - [`PipelineError::AssetDecode`] if the decoder rejected an asset.
/// - [`PipelineError::ClipEmpty`] if no valid cell falls inside the area.
/// - [`PipelineError::InvalidConfig`] if a required reprojection is unsupported.
pub fn load_bands(
    scene: &SceneCandidate,
    aoi: &AreaOfInterest,
    decoder: &dyn AssetDecoder,
    config: &LoaderConfig,
    policy: &RetryPolicy,
    parallel: bool,
) -> Result<LoadedScene, PipelineError> {
    let band_asset = |band: Band| {
        let key = config.assets.key(band);
        scene
            .asset(key)
            .ok_or_else(|| PipelineError::BandUnavailable {
                scene: scene.id().to_string(),
                band,
                asset: key.to_string(),
            })
    };
    let nir_asset = band_asset(Band::Nir)?;
    let red_asset = band_asset(Band::Red)?;
    let mask_asset = config
        .assets
        .mask
        .as_deref()
        .and_then(|key| scene.asset(key));
    if mask_asset.is_none() {
        tracing::debug!(scene = scene.id(), "no quality mask asset; relying on band flags");
    }

    let fetch_nir = || fetch(nir_asset, policy, |a, t| decoder.decode_band(a, Band::Nir, t));
    let fetch_red = || fetch(red_asset, policy, |a, t| decoder.decode_band(a, Band::Red, t));
    let fetch_mask = || {
        mask_asset
            .map(|asset| fetch(asset, policy, |a, t| decoder.decode_mask(a, t)))
            .transpose()
    };

    let ((nir, red), mask) = if parallel {
        rayon::join(|| rayon::join(fetch_nir, fetch_red), fetch_mask)
    } else {
        ((fetch_nir(), fetch_red()), fetch_mask())
    };
    let (nir, red, mask) = (nir?, red?, mask?);

    let target = config.target_crs.resolve(scene.crs());
    let area = aoi.project(target)?;
    let grid = output_grid(&nir.spec, &red.spec, target, &area, scene.id())?;
    let inside = polygon_mask(&grid, &area);

    let (nir_values, nir_quality) = resample_band(&nir, &grid, &inside)?;
    let (red_values, red_quality) = resample_band(&red, &grid, &inside)?;
    let mask_quality = mask
        .map(|m| resample_nearest(&m.classes, &m.spec, &grid, PixelQuality::NoData))
        .transpose()?;

    let quality = combine_quality(&grid, [nir_quality, red_quality, mask_quality]);
    let observed = quality.mapv(PixelQuality::is_observed);
    let clear = quality.mapv(PixelQuality::is_clear);

    let nir_values = nir_values.with_mask(&observed)?;
    let red_values = red_values.with_mask(&observed)?;

    let clipped_pixels = count_both(&nir_values, &red_values, None);
    if clipped_pixels == 0 {
        return Err(PipelineError::ClipEmpty {
            scene: scene.id().to_string(),
        });
    }
    let usable_pixels = count_both(&nir_values, &red_values, Some(&clear));
    let cloud_masked_pixels = clipped_pixels - usable_pixels;

    tracing::debug!(
        scene = scene.id(),
        crs = %target,
        rows = grid.rows,
        cols = grid.cols,
        clipped_pixels,
        cloud_masked_pixels,
        "loaded bands"
    );

    let scene_ref = SceneRef {
        id: scene.id().to_string(),
        acquired: scene.acquired(),
        cloud_cover: scene.cloud_cover(),
    };
    Ok(LoadedScene {
        nir: SpectralRaster {
            band: Band::Nir,
            spec: grid,
            grid: nir_values.with_mask(&clear)?,
            scene: scene_ref.clone(),
        },
        red: SpectralRaster {
            band: Band::Red,
            spec: grid,
            grid: red_values.with_mask(&clear)?,
            scene: scene_ref,
        },
        clipped_pixels,
        cloud_masked_pixels,
    })
}

fn fetch<T>(
    asset: &AssetRef,
    policy: &RetryPolicy,
    decode: impl Fn(&AssetRef, Duration) -> Result<T, DecodeError>,
) -> Result<T, PipelineError> {
    retry(policy, "asset fetch", |_| decode(asset, policy.request_timeout)).map_err(|err| {
        match err {
            RetryError::Exhausted { attempts, last } => PipelineError::FetchUnavailable {
                href: asset.href.clone(),
                attempts,
                reason: last.to_string(),
            },
            RetryError::Permanent(last) => PipelineError::AssetDecode {
                href: asset.href.clone(),
                reason: last.to_string(),
            },
        }
    })
}

/// The coarser band's grid in `target`, cropped to the area.
fn output_grid(
    nir: &GridSpec,
    red: &GridSpec,
    target: Crs,
    area: &Polygon<f64>,
    scene: &str,
) -> Result<GridSpec, PipelineError> {
    let nir = reprojected_spec(nir, target)?;
    let red = reprojected_spec(red, target)?;
    let base = if red.pixel_area() > nir.pixel_area() { red } else { nir };

    let clip_empty = || PipelineError::ClipEmpty {
        scene: scene.to_string(),
    };
    let bounds = area
        .bounding_rect()
        .map(|r| Extent::new(r.min().x, r.min().y, r.max().x, r.max().y))
        .ok_or_else(clip_empty)?;
    let window = base.snapped_window(&bounds).ok_or_else(clip_empty)?;
    Ok(base.window(window))
}

/// `true` where the cell center lies inside `polygon`.
fn polygon_mask(grid: &GridSpec, polygon: &Polygon<f64>) -> Array2<bool> {
    Array2::from_shape_fn(grid.shape(), |(row, col)| {
        let (x, y) = grid.transform.pixel_center(row, col);
        polygon.contains(&Point::new(x, y))
    })
}

/// Resample a decoded band onto `grid`, dropping nodata and cells outside
/// the polygon. Also returns its quality flags on `grid`, if any.
fn resample_band(
    band: &DecodedBand,
    grid: &GridSpec,
    inside: &Array2<bool>,
) -> Result<(MaskedGrid, Option<Array2<PixelQuality>>), PipelineError> {
    let valid = band
        .values
        .mapv(|v| v.is_finite() && band.nodata.is_none_or(|nd| v != nd));
    let native = MaskedGrid::new(band.values.clone(), valid)?;
    let values = resample(&native, &band.spec, grid, ResampleMethod::Bilinear)?.with_mask(inside)?;
    let quality = band
        .quality
        .as_ref()
        .map(|q| resample_nearest(q, &band.spec, grid, PixelQuality::NoData))
        .transpose()?;
    Ok((values, quality))
}

/// Worst flag per cell across all sources. Missing sources count as clear.
fn combine_quality(grid: &GridSpec, sources: [Option<Array2<PixelQuality>>; 3]) -> Array2<PixelQuality> {
    let mut combined = Array2::from_elem(grid.shape(), PixelQuality::Clear);
    for source in sources.iter().flatten() {
        Zip::from(&mut combined).and(source).for_each(|acc, &q| {
            if !q.is_observed() || (acc.is_observed() && !q.is_clear()) {
                *acc = q;
            }
        });
    }
    combined
}

fn count_both(a: &MaskedGrid, b: &MaskedGrid, extra: Option<&Array2<bool>>) -> usize {
    let mut count = 0;
    Zip::indexed(a.valid()).and(b.valid()).for_each(|idx, &va, &vb| {
        let keep = extra.is_none_or(|m| m[idx]);
        if va && vb && keep {
            count += 1;
        }
    });
    count
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::raster::GeoTransform;
    use crate::testing::{FakeDecoder, fast_retry, test_aoi, test_scene, test_spec, uniform_band};

    fn load(scene: &SceneCandidate, decoder: &FakeDecoder) -> Result<LoadedScene, PipelineError> {
        load_bands(
            scene,
            &test_aoi(),
            decoder,
            &LoaderConfig::default(),
            &fast_retry(),
            true,
        )
    }

    #[test]
    fn scl_codes_map_to_quality() {
        assert_eq!(PixelQuality::from_scl(0), PixelQuality::NoData);
        assert_eq!(PixelQuality::from_scl(1), PixelQuality::Saturated);
        assert_eq!(PixelQuality::from_scl(3), PixelQuality::CloudShadow);
        assert_eq!(PixelQuality::from_scl(4), PixelQuality::Clear);
        assert_eq!(PixelQuality::from_scl(9), PixelQuality::Cloud);
        assert_eq!(PixelQuality::from_scl(10), PixelQuality::Cloud);
        assert!(!PixelQuality::Cloud.is_usable());
        assert!(PixelQuality::Cloud.is_observed());
        assert!(!PixelQuality::NoData.is_observed());
    }

    #[test]
    fn clips_to_area_of_interest() {
        let scene = test_scene("s", 2020, 0.1);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", uniform_band(0.1));
        let loaded = load(&scene, &decoder).unwrap();
        assert_eq!(loaded.nir.spec.shape(), (6, 6));
        assert!(loaded.nir.spec.same_grid(&loaded.red.spec));
        assert_eq!(loaded.nir.grid.valid_count(), 36);
        assert_eq!(loaded.clipped_pixels, 36);
        assert_eq!(loaded.cloud_masked_pixels, 0);
        assert_eq!(loaded.nir.grid.get(0, 0), Some(0.5));
        assert_eq!(loaded.red.scene.id, "s");
    }

    #[test]
    fn missing_band_is_band_unavailable() {
        let scene = SceneCandidate::new(
            "s",
            "sentinel-2-l2a",
            crate::testing::date(2020, 7, 1),
            0.1,
            crate::testing::wide_footprint(),
            Crs::Wgs84,
        )
        .with_asset("red", "s/red");
        let err = load(&scene, &FakeDecoder::new()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BandUnavailable { band: Band::Nir, ref asset, .. } if asset == "nir"
        ));
    }

    #[test]
    fn all_nodata_is_clip_empty() {
        let scene = test_scene("s", 2020, 0.1);
        let mut nir = uniform_band(-9999.0);
        nir.nodata = Some(-9999.0);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", nir)
            .with_band(&scene, "red", uniform_band(0.1));
        let err = load(&scene, &decoder).unwrap_err();
        assert_eq!(err, PipelineError::ClipEmpty { scene: "s".to_string() });
    }

    #[test]
    fn area_outside_raster_is_clip_empty() {
        let scene = test_scene("s", 2020, 0.1);
        let mut nir = uniform_band(0.5);
        nir.spec.transform = GeoTransform::new(-50.0, 10.0, 0.01, -0.01);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", nir.clone())
            .with_band(&scene, "red", nir);
        let err = load(&scene, &decoder).unwrap_err();
        assert!(matches!(err, PipelineError::ClipEmpty { .. }));
    }

    #[test]
    fn fully_clouded_scene_is_all_invalid_not_error() {
        let scene = test_scene("s", 2020, 0.9).with_asset("scl", "s/scl");
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", uniform_band(0.1))
            .with_mask(&scene, "scl", Array2::from_elem((10, 10), PixelQuality::Cloud));
        let loaded = load(&scene, &decoder).unwrap();
        assert_eq!(loaded.nir.grid.valid_count(), 0);
        assert_eq!(loaded.red.grid.valid_count(), 0);
        assert_eq!(loaded.clipped_pixels, 36);
        assert_eq!(loaded.cloud_masked_pixels, 36);
    }

    #[test]
    fn band_quality_flags_mask_clouds() {
        let scene = test_scene("s", 2020, 0.1);
        let mut nir = uniform_band(0.5);
        let mut quality = Array2::from_elem((10, 10), PixelQuality::Clear);
        quality[[2, 2]] = PixelQuality::CloudShadow;
        quality[[2, 3]] = PixelQuality::Saturated;
        nir.quality = Some(quality);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", nir)
            .with_band(&scene, "red", uniform_band(0.1));
        let loaded = load(&scene, &decoder).unwrap();
        // Window starts at source cell (2, 2).
        assert_eq!(loaded.nir.grid.get(0, 0), None);
        assert_eq!(loaded.red.grid.get(0, 0), None);
        assert_eq!(loaded.nir.grid.get(0, 1), None);
        assert_eq!(loaded.clipped_pixels, 35);
        assert_eq!(loaded.cloud_masked_pixels, 1);
    }

    #[test]
    fn coarser_band_defines_grid() {
        let scene = test_scene("s", 2020, 0.1);
        let coarse = DecodedBand {
            spec: GridSpec::new(
                Crs::Wgs84,
                GeoTransform::new(-104.0, 44.0, 0.02, -0.02),
                5,
                5,
            ),
            values: Array2::from_elem((5, 5), 0.1),
            nodata: None,
            quality: None,
        };
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", coarse);
        let loaded = load(&scene, &decoder).unwrap();
        let (rx, ry) = loaded.nir.spec.resolution();
        assert!((rx - 0.02).abs() < 1e-12 && (ry - 0.02).abs() < 1e-12);
        assert!(loaded.nir.spec.same_grid(&loaded.red.spec));
        assert_eq!(loaded.nir.spec.shape(), (3, 3));
    }

    #[test]
    fn reprojects_to_equal_area_target() {
        let scene = test_scene("s", 2020, 0.1);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", uniform_band(0.1));
        let config = LoaderConfig {
            target_crs: TargetCrs::Epsg(Crs::EqualArea),
            ..LoaderConfig::default()
        };
        let loaded = load_bands(&scene, &test_aoi(), &decoder, &config, &fast_retry(), false).unwrap();
        assert_eq!(loaded.nir.spec.crs, Crs::EqualArea);
        assert!(loaded.nir.grid.valid_count() > 0);
        let v = loaded.nir.grid.values().iter().zip(loaded.nir.grid.valid()).find(|(_, ok)| **ok);
        assert!((v.unwrap().0 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn transient_fetch_failures_are_retried_then_surface() {
        let scene = test_scene("s", 2020, 0.1);
        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", uniform_band(0.1))
            .failing_times(&format!("{}/red", scene.id()), 2);
        assert!(load(&scene, &decoder).is_ok());

        let decoder = FakeDecoder::new()
            .with_band(&scene, "nir", uniform_band(0.5))
            .with_band(&scene, "red", uniform_band(0.1))
            .failing_times(&format!("{}/nir", scene.id()), 10);
        let err = load(&scene, &decoder).unwrap_err();
        assert!(matches!(err, PipelineError::FetchUnavailable { attempts: 3, .. }));
    }

    #[test]
    fn corrupt_asset_is_decode_error() {
        let scene = test_scene("s", 2020, 0.1);
        let decoder = FakeDecoder::new().with_band(&scene, "red", uniform_band(0.1));
        let err = load(&scene, &decoder).unwrap_err();
        assert!(matches!(err, PipelineError::AssetDecode { ref href, .. } if href == "s/nir"));
    }

    #[test]
    fn test_spec_matches_uniform_band() {
        assert_eq!(uniform_band(0.0).spec, test_spec());
    }
}
