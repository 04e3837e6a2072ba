//! Shared types for the verdure change-detection pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::Thresholds;
use crate::load::LoaderConfig;
use crate::retry::RetryPolicy;
use crate::select::{Season, SelectionConfig};

/// Spectral band needed by the vegetation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    /// Near-infrared reflectance.
    Nir,
    /// Red reflectance.
    Red,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nir => f.write_str("nir"),
            Self::Red => f.write_str("red"),
        }
    }
}

/// Configuration for one analysis invocation.
///
/// Every field has a default, so a partial JSON document such as
/// `{"collection": "landsat-c2-l2"}` deserializes into a complete config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Catalog collection to search (sensor family).
    pub collection: String,

    /// Calendar window searched inside each target year.
    pub season: Season,

    /// Candidate filtering and ranking.
    pub selection: SelectionConfig,

    /// Band asset keys and target coordinate reference system.
    pub loader: LoaderConfig,

    /// Change-class band edges. A request may override these.
    pub thresholds: Thresholds,

    /// Timeout and retry budget for catalog queries and asset fetches.
    pub retry: RetryPolicy,

    /// Run independent work (the two years, the two bands) concurrently.
    pub parallel: bool,
}

impl AnalysisConfig {
    /// Default catalog collection.
    pub const DEFAULT_COLLECTION: &'static str = "sentinel-2-l2a";

    /// Check every section is usable before any I/O happens.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.collection.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "collection must not be empty".to_string(),
            ));
        }
        // Any leap year accepts every real month/day pair.
        self.season.window(2000)?;
        self.selection.validate()?;
        self.retry.validate()
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            collection: Self::DEFAULT_COLLECTION.to_string(),
            season: Season::default(),
            selection: SelectionConfig::default(),
            loader: LoaderConfig::default(),
            thresholds: Thresholds::default(),
            retry: RetryPolicy::default(),
            parallel: true,
        }
    }
}

/// Errors produced by individual pipeline components.
///
/// Every variant is fatal to the current analysis. Only the two
/// `*Unavailable` variants stem from transient conditions, and they are
/// raised only after the retry budget has been spent.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// The catalog returned no usable scene for the window.
    #[error("no {collection} imagery intersects the area between {start} and {end}")]
    NoImageryFound {
        /// Collection that was searched.
        collection: String,
        /// First day of the search window.
        start: chrono::NaiveDate,
        /// Last day of the search window.
        end: chrono::NaiveDate,
    },

    /// The catalog could not be reached within the retry budget.
    #[error("catalog unavailable after {attempts} attempt(s): {reason}")]
    CatalogUnavailable {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reported by the catalog.
        reason: String,
    },

    /// An asset fetch kept failing transiently until the retry budget ran out.
    #[error("asset {href} unavailable after {attempts} attempt(s): {reason}")]
    FetchUnavailable {
        /// Asset location.
        href: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reported by the decoder.
        reason: String,
    },

    /// The scene has no asset for a requested band.
    #[error("scene {scene} has no `{asset}` asset for the {band} band")]
    BandUnavailable {
        /// Scene identifier.
        scene: String,
        /// Band that was requested.
        band: Band,
        /// Asset key that was looked up.
        asset: String,
    },

    /// The decoder rejected an asset (corrupt data or unsupported format).
    #[error("failed to decode asset {href}: {reason}")]
    AssetDecode {
        /// Asset location.
        href: String,
        /// Decoder message.
        reason: String,
    },

    /// Clipping to the area of interest left no valid pixel.
    #[error("scene {scene} has no valid pixel inside the area of interest")]
    ClipEmpty {
        /// Scene identifier.
        scene: String,
    },

    /// Two rasters that must share a grid do not.
    #[error("raster grids differ: {reason}")]
    GridMismatch {
        /// Which property differs.
        reason: String,
    },

    /// The two index rasters do not intersect spatially.
    #[error("index rasters do not overlap")]
    NoOverlap,

    /// The area-of-interest polygon is malformed.
    #[error("invalid area of interest: {0}")]
    InvalidAoi(String),

    /// A configuration value or request parameter is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Request and configuration checks before any I/O.
    Validation,
    /// Catalog search and candidate ranking.
    Selection,
    /// Band fetch, reprojection, clipping and cloud masking.
    Loading,
    /// Vegetation index computation.
    Index,
    /// Best-observation merge of several scenes.
    Mosaic,
    /// Resampling both years onto a shared grid.
    Alignment,
    /// Differencing and class assignment.
    Classification,
    /// Statistical reduction.
    Summary,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => f.write_str("validation"),
            Self::Selection => f.write_str("asset selection"),
            Self::Loading => f.write_str("raster loading"),
            Self::Index => f.write_str("index computation"),
            Self::Mosaic => f.write_str("mosaicking"),
            Self::Alignment => f.write_str("temporal alignment"),
            Self::Classification => f.write_str("change classification"),
            Self::Summary => f.write_str("statistics"),
        }
    }
}

/// A [`PipelineError`] tagged with the stage (and target year) that
/// produced it. This is the only error the top-level entry points return.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{stage} failed{}: {error}", year_suffix(.year))]
pub struct AnalysisError {
    /// Stage that failed.
    pub stage: Stage,
    /// Target year of the failing sub-pipeline, for per-year stages.
    pub year: Option<i32>,
    /// Underlying cause.
    #[source]
    pub error: PipelineError,
}

impl AnalysisError {
    /// Tag an error with its stage.
    #[must_use]
    pub const fn new(stage: Stage, year: Option<i32>, error: PipelineError) -> Self {
        Self { stage, year, error }
    }
}

#[allow(clippy::ref_option)]
fn year_suffix(year: &Option<i32>) -> String {
    year.map(|y| format!(" for {y}")).unwrap_or_default()
}

/// Attach stage context to a component result.
pub(crate) trait StageContext<T> {
    fn at(self, stage: Stage, year: Option<i32>) -> Result<T, AnalysisError>;
}

impl<T> StageContext<T> for Result<T, PipelineError> {
    fn at(self, stage: Stage, year: Option<i32>) -> Result<T, AnalysisError> {
        self.map_err(|error| AnalysisError::new(stage, year, error))
    }
}
