//! verdure-pipeline: Pure vegetation change-detection pipeline (sans-IO).
//!
//! Compares a normalized-difference vegetation index between two years
//! over an area of interest:
//! scene selection -> band loading -> index -> (mosaic) ->
//! temporal alignment -> change classification -> statistics.
//!
//! This crate has **no I/O dependencies**. The imagery catalog and the
//! raster decoder are passed in as [`Catalog`] and [`AssetDecoder`]
//! handles; filesystem-backed implementations live in `verdure-io`.

pub mod align;
pub mod aoi;
pub mod classify;
pub mod crs;
pub mod diagnostics;
pub mod index;
pub mod load;
pub mod mosaic;
pub mod pipeline;
pub mod raster;
pub mod resample;
pub mod retry;
pub mod sampling;
pub mod select;
pub mod stats;
pub mod types;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod testing;

pub use aoi::AreaOfInterest;
pub use classify::{ChangeClass, ChangeMap, Thresholds};
pub use crs::Crs;
pub use load::{AssetDecoder, DecodeError, DecodedBand, DecodedMask, LoaderConfig, PixelQuality, TargetCrs};
pub use pipeline::{AnalysisRequest, AnalysisResult, Pipeline};
pub use raster::{Extent, GeoTransform, GridSpec, IndexRaster, MaskedGrid};
pub use retry::RetryPolicy;
pub use sampling::PointSample;
pub use select::{AssetRef, Catalog, CatalogError, CatalogQuery, SceneCandidate, Season, SelectionConfig};
pub use stats::{AreaUnit, ChangeStatistics, ClassStatistics, DeltaSummary};
pub use types::{AnalysisConfig, AnalysisError, Band, PipelineError, Stage};

/// Run the full change analysis.
///
/// Selects the best scene for `request.start_year` and
/// `request.end_year`, loads and clips their red and near-infrared bands,
/// computes the vegetation index for each, aligns the two index rasters,
/// classifies the per-cell change and summarizes it.
///
/// # Pipeline steps
///
/// 1. Validate the request and configuration
/// 2. Per year: select scene(s) from `catalog`
/// 3. Per year: fetch bands through `decoder`, reproject, clip, cloud-mask
/// 4. Per year: compute the index (and mosaic, if several scenes)
/// 5. Align both index rasters onto a shared grid
/// 6. Difference and classify
/// 7. Summarize
///
/// # Errors
///
/// Returns an [`AnalysisError`] naming the failing [`Stage`], the year for
/// per-year stages, and the underlying [`PipelineError`]. A failure never
/// comes with a partial result.
pub fn analyze(
    request: AnalysisRequest,
    config: AnalysisConfig,
    catalog: &dyn Catalog,
    decoder: &dyn AssetDecoder,
) -> Result<AnalysisResult, AnalysisError> {
    Ok(Pipeline::new(request, config)
        .acquire(catalog, decoder)?
        .align()?
        .classify()?
        .summarize()
        .into_result())
}
