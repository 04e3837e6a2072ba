//! Incremental analysis: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::analyze`] which runs the whole analysis in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust,no_run
//! # use verdure_pipeline::{AnalysisConfig, AnalysisError, AnalysisRequest, Pipeline};
//! # use verdure_pipeline::{AssetDecoder, Catalog};
//! # fn run(
//! #     request: AnalysisRequest,
//! #     catalog: &dyn Catalog,
//! #     decoder: &dyn AssetDecoder,
//! # ) -> Result<(), AnalysisError> {
//! let acquired = Pipeline::new(request, AnalysisConfig::default()).acquire(catalog, decoder)?;
//! println!("before: {:?}", acquired.before().index.scenes);
//!
//! let result = acquired.align()?.classify()?.summarize().into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages). Errors come back as
//! [`AnalysisError`], tagged with the failing stage and, for the per-year
//! stages, the target year.
//!
//! # Concurrency
//!
//! [`Pending::acquire`] runs the two target years as independent
//! sub-pipelines joined before alignment. Selection for both years
//! completes before any band is fetched, so a year without imagery aborts
//! the analysis without touching the decoder. With `config.parallel` each
//! pair of year tasks runs on the rayon pool (and each scene fetches its
//! bands concurrently). Both branches always run to completion; when both
//! fail, the start year's error is returned.

use chrono::NaiveDate;

use crate::align::{AlignedPair, align};
use crate::aoi::AreaOfInterest;
use crate::classify::{ChangeMap, Thresholds, classify};
use crate::diagnostics::{Clock, NoopClock, StageDiagnostics, StageMetrics, YearDiagnostics};
use crate::index::compute_index;
use crate::load::{AssetDecoder, LoadedScene, load_bands};
use crate::mosaic::mosaic;
use crate::raster::IndexRaster;
use crate::select::{Catalog, DateWindow, Selection, select_scenes};
use crate::stats::{ChangeStatistics, summarize};
use crate::types::{AnalysisConfig, AnalysisError, PipelineError, Stage, StageContext};

/// What to analyze: an area and the two years to compare.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    /// Region to analyze.
    pub aoi: AreaOfInterest,
    /// Year of the earlier ("before") acquisition.
    pub start_year: i32,
    /// Year of the later ("after") acquisition.
    pub end_year: i32,
    /// Overrides `config.thresholds` when set.
    pub thresholds: Option<Thresholds>,
}

impl AnalysisRequest {
    /// Request using the configured thresholds.
    #[must_use]
    pub const fn new(aoi: AreaOfInterest, start_year: i32, end_year: i32) -> Self {
        Self {
            aoi,
            start_year,
            end_year,
            thresholds: None,
        }
    }

    /// Override the change-class thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Check the years are in order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] unless `start_year < end_year`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.start_year >= self.end_year {
            return Err(PipelineError::InvalidConfig(format!(
                "start year {} must precede end year {}",
                self.start_year, self.end_year
            )));
        }
        Ok(())
    }
}

/// Complete output of one analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// Per-cell delta and class.
    pub change_map: ChangeMap,
    /// Per-class and overall statistics of `change_map`.
    pub statistics: ChangeStatistics,
    /// Aligned earlier index raster (same grid as `change_map`).
    pub before: IndexRaster,
    /// Aligned later index raster (same grid as `change_map`).
    pub after: IndexRaster,
}

/// Products of one year's sub-pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct YearAcquisition {
    /// Target year.
    pub year: i32,
    /// Scenes chosen for the year.
    pub selection: Selection,
    /// Index raster, mosaicked when several scenes were chosen.
    pub index: IndexRaster,
}

impl YearAcquisition {
    /// Search window of the year.
    #[must_use]
    pub const fn window(&self) -> DateWindow {
        self.selection.window
    }

    /// Acquisition date of the primary scene.
    #[must_use]
    pub const fn acquired(&self) -> NaiveDate {
        self.index.acquired
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`acquire`](Self::acquire) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing, call .acquire() to continue"]
pub struct Pending {
    request: AnalysisRequest,
    config: AnalysisConfig,
}

impl Pending {
    /// The request being analyzed.
    #[must_use]
    pub const fn request(&self) -> &AnalysisRequest {
        &self.request
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Validate, then select, load and index imagery for both years.
    ///
    /// # Errors
    ///
    /// - [`Stage::Validation`] for a malformed request or config; nothing
    ///   is fetched.
    /// - [`Stage::Selection`], [`Stage::Loading`], [`Stage::Index`] or
    ///   [`Stage::Mosaic`] tagged with the failing year.
    pub fn acquire(
        self,
        catalog: &dyn Catalog,
        decoder: &dyn AssetDecoder,
    ) -> Result<Acquired, AnalysisError> {
        self.acquire_timed(catalog, decoder, &NoopClock)
            .map(|(acquired, _)| acquired)
    }

    /// [`acquire`](Self::acquire), timing every per-year stage.
    pub(crate) fn acquire_timed<C: Clock>(
        self,
        catalog: &dyn Catalog,
        decoder: &dyn AssetDecoder,
        clock: &C,
    ) -> Result<(Acquired, [YearDiagnostics; 2]), AnalysisError> {
        self.request
            .validate()
            .and_then(|()| self.config.validate())
            .at(Stage::Validation, None)?;

        tracing::info!(
            start_year = self.request.start_year,
            end_year = self.request.end_year,
            collection = %self.config.collection,
            parallel = self.config.parallel,
            "starting analysis"
        );

        let aoi = &self.request.aoi;
        let config = &self.config;
        let (start_year, end_year) = (self.request.start_year, self.request.end_year);

        // Both selections finish before any band is fetched.
        let (before, after) = join_if(
            config.parallel,
            || select_year(start_year, aoi, config, catalog, clock),
            || select_year(end_year, aoi, config, catalog, clock),
        );
        let (before, after) = both_years(before, after)?;

        let (before, after) = join_if(
            config.parallel,
            || load_year(before, aoi, config, decoder, clock),
            || load_year(after, aoi, config, decoder, clock),
        );
        let ((before, before_diag), (after, after_diag)) = both_years(before, after)?;

        Ok((
            Acquired {
                request: self.request,
                config: self.config,
                before,
                after,
            },
            [before_diag, after_diag],
        ))
    }
}

/// Combine the two per-year outcomes. The start year's error is returned
/// when both fail; the end year's is logged rather than dropped.
fn both_years<A, B>(
    before: Result<A, AnalysisError>,
    after: Result<B, AnalysisError>,
) -> Result<(A, B), AnalysisError> {
    match (before, after) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(first), Err(other)) => {
            tracing::warn!(
                year = other.year,
                stage = %other.stage,
                error = %other.error,
                "end year also failed"
            );
            Err(first)
        }
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
    }
}

/// Run two independent computations, on the rayon pool when `parallel`.
fn join_if<A, B, RA, RB>(parallel: bool, a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if parallel {
        rayon::join(a, b)
    } else {
        (a(), b())
    }
}

/// A year whose scenes are chosen but not yet fetched.
struct SelectedYear {
    year: i32,
    selection: Selection,
    diagnostics: StageDiagnostics,
}

fn select_year<C: Clock>(
    year: i32,
    aoi: &AreaOfInterest,
    config: &AnalysisConfig,
    catalog: &dyn Catalog,
    clock: &C,
) -> Result<SelectedYear, AnalysisError> {
    let t = clock.now();
    let window = config.season.window(year).at(Stage::Selection, Some(year))?;
    let selection = select_scenes(
        catalog,
        aoi,
        window,
        &config.collection,
        &config.selection,
        &config.retry,
    )
    .at(Stage::Selection, Some(year))?;
    let diagnostics = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: StageMetrics::Selection {
            candidates_returned: selection.candidates_returned,
            candidates_eligible: selection.candidates_eligible,
            scene_ids: selection
                .scenes
                .iter()
                .map(|r| r.scene.id().to_string())
                .collect(),
            cloud_cover: selection
                .primary()
                .map_or(0.0, |r| r.scene.cloud_cover()),
        },
    };
    Ok(SelectedYear {
        year,
        selection,
        diagnostics,
    })
}

/// Loading, index and optional mosaic for one selected year.
fn load_year<C: Clock>(
    selected: SelectedYear,
    aoi: &AreaOfInterest,
    config: &AnalysisConfig,
    decoder: &dyn AssetDecoder,
    clock: &C,
) -> Result<(YearAcquisition, YearDiagnostics), AnalysisError> {
    let SelectedYear {
        year,
        selection,
        diagnostics: selection_diag,
    } = selected;

    let t = clock.now();
    let loaded = selection
        .scenes
        .iter()
        .map(|ranked| {
            load_bands(
                &ranked.scene,
                aoi,
                decoder,
                &config.loader,
                &config.retry,
                config.parallel,
            )
        })
        .collect::<Result<Vec<LoadedScene>, _>>()
        .at(Stage::Loading, Some(year))?;
    let (rows, cols) = loaded.first().map_or((0, 0), |l| l.nir.spec.shape());
    let loading_diag = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: StageMetrics::Loading {
            rows,
            cols,
            clipped_pixels: loaded.iter().map(|l| l.clipped_pixels).sum(),
            cloud_masked_pixels: loaded.iter().map(|l| l.cloud_masked_pixels).sum(),
        },
    };

    let t = clock.now();
    let indices = loaded
        .iter()
        .map(|l| compute_index(&l.nir, &l.red))
        .collect::<Result<Vec<IndexRaster>, _>>()
        .at(Stage::Index, Some(year))?;
    drop(loaded);
    let index_diag = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: StageMetrics::Index {
            valid: indices.iter().map(|i| i.grid.valid_count()).sum(),
            cells: indices.iter().map(|i| i.spec.len()).sum(),
        },
    };

    let t = clock.now();
    let scenes = indices.len();
    let valid_before = indices.first().map_or(0, |i| i.grid.valid_count());
    let index = mosaic(indices).at(Stage::Mosaic, Some(year))?;
    let mosaic_diag = (scenes > 1).then(|| StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: StageMetrics::Mosaic {
            scenes,
            valid_before,
            valid_after: index.grid.valid_count(),
        },
    });

    tracing::info!(
        year,
        scenes = ?index.scenes,
        acquired = %index.acquired,
        valid = index.grid.valid_count(),
        "acquired year"
    );

    Ok((
        YearAcquisition {
            year,
            selection,
            index,
        },
        YearDiagnostics {
            year,
            selection: selection_diag,
            loading: loading_diag,
            index: index_diag,
            mosaic: mosaic_diag,
        },
    ))
}

// ───────────────────────── Stage 1: Acquired ─────────────────────────

/// Pipeline state after both years have an index raster.
///
/// Call [`align`](Self::align) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing, call .align() to continue"]
pub struct Acquired {
    request: AnalysisRequest,
    config: AnalysisConfig,
    before: YearAcquisition,
    after: YearAcquisition,
}

impl Acquired {
    /// Start-year products.
    #[must_use]
    pub const fn before(&self) -> &YearAcquisition {
        &self.before
    }

    /// End-year products.
    #[must_use]
    pub const fn after(&self) -> &YearAcquisition {
        &self.after
    }

    /// Put both index rasters on one grid.
    ///
    /// # Errors
    ///
    /// [`Stage::Alignment`] with [`PipelineError::NoOverlap`] when the
    /// rasters are disjoint.
    pub fn align(self) -> Result<Aligned, AnalysisError> {
        let pair = align(self.before.index, self.after.index).at(Stage::Alignment, None)?;
        Ok(Aligned {
            request: self.request,
            config: self.config,
            pair,
        })
    }
}

// ───────────────────────── Stage 2: Aligned ──────────────────────────

/// Pipeline state after temporal alignment.
///
/// Call [`classify`](Self::classify) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing, call .classify() to continue"]
pub struct Aligned {
    request: AnalysisRequest,
    config: AnalysisConfig,
    pair: AlignedPair,
}

impl Aligned {
    /// The aligned rasters.
    #[must_use]
    pub const fn pair(&self) -> &AlignedPair {
        &self.pair
    }

    pub(crate) fn metrics(&self) -> StageMetrics {
        let (rows, cols) = self.pair.before.spec.shape();
        StageMetrics::Alignment {
            resampled: self.pair.resampled,
            rows,
            cols,
        }
    }

    /// Difference and classify, using the request's thresholds if given.
    ///
    /// # Errors
    ///
    /// [`Stage::Classification`] with [`PipelineError::GridMismatch`];
    /// unreachable after a successful alignment.
    pub fn classify(self) -> Result<Classified, AnalysisError> {
        let thresholds = self
            .request
            .thresholds
            .as_ref()
            .unwrap_or(&self.config.thresholds);
        let change_map = classify(&self.pair.before, &self.pair.after, thresholds)
            .at(Stage::Classification, None)?;
        tracing::debug!(
            valid = change_map.valid_count(),
            bands = thresholds.band_count(),
            "classified change"
        );
        Ok(Classified {
            pair: self.pair,
            change_map,
        })
    }
}

// ───────────────────────── Stage 3: Classified ───────────────────────

/// Pipeline state after classification.
///
/// Call [`summarize`](Self::summarize) to advance to the final stage.
#[must_use = "pipeline stages are consumed by advancing, call .summarize() to continue"]
pub struct Classified {
    pair: AlignedPair,
    change_map: ChangeMap,
}

impl Classified {
    /// The classified map.
    #[must_use]
    pub const fn change_map(&self) -> &ChangeMap {
        &self.change_map
    }

    pub(crate) fn metrics(&self) -> StageMetrics {
        let valid = self.change_map.valid_count();
        StageMetrics::Classification {
            valid,
            invalid: self.change_map.spec.len() - valid,
        }
    }

    /// Reduce the map to statistics. Infallible.
    pub fn summarize(self) -> Summarized {
        let statistics = summarize(&self.change_map);
        tracing::info!(
            valid = statistics.total_valid,
            invalid = statistics.total_invalid,
            mean_delta = statistics.overall.mean,
            "summarized change"
        );
        Summarized {
            pair: self.pair,
            change_map: self.change_map,
            statistics,
        }
    }
}

// ───────────────────────── Stage 4: Summarized ───────────────────────

/// Final pipeline state.
///
/// Call [`into_result`](Self::into_result) to extract the
/// [`AnalysisResult`].
#[must_use = "call .into_result() to extract the AnalysisResult"]
pub struct Summarized {
    pair: AlignedPair,
    change_map: ChangeMap,
    statistics: ChangeStatistics,
}

impl Summarized {
    /// The statistics.
    #[must_use]
    pub const fn statistics(&self) -> &ChangeStatistics {
        &self.statistics
    }

    pub(crate) const fn metrics(&self) -> StageMetrics {
        StageMetrics::Summary {
            total_valid: self.statistics.total_valid,
        }
    }

    /// Consume the pipeline and return the [`AnalysisResult`].
    #[must_use]
    pub fn into_result(self) -> AnalysisResult {
        AnalysisResult {
            change_map: self.change_map,
            statistics: self.statistics,
            before: self.pair.before,
            after: self.pair.after,
        }
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental change-detection pipeline.
///
/// Created via [`Pipeline::new`], which stores the request and config
/// without doing any work. Each stage method consumes the current state
/// and returns the next, making it a compile-time error to skip stages
/// or call them out of order.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline. Nothing is validated or fetched yet.
    #[allow(clippy::new_ret_no_self)]
    pub const fn new(request: AnalysisRequest, config: AnalysisConfig) -> Pending {
        Pending { request, config }
    }
}
