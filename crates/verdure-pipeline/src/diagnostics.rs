//! Analysis diagnostics: timing, counts, and other metrics for each stage.
//!
//! [`analyze_with_diagnostics`] drives the staged [`Pipeline`] and records
//! how long every transition took alongside the counts that explain its
//! outcome (candidates seen, pixels clipped or clouded, cells resampled).
//!
//! Time is read through the [`Clock`] trait so the core stays free of
//! platform clocks: the CLI passes one backed by `std::time::Instant`,
//! tests pass [`NoopClock`].
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load::AssetDecoder;
use crate::pipeline::{AnalysisRequest, AnalysisResult, Pipeline};
use crate::select::Catalog;
use crate::types::{AnalysisConfig, AnalysisError};

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of monotonic timestamps.
///
/// Implementations must be shareable across threads because the two
/// target years may be acquired concurrently.
pub trait Clock: Sync {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// A clock that never advances. Every duration is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClock;

impl Clock for NoopClock {
    type Instant = ();

    fn now(&self) {}

    fn elapsed(&self, _since: &()) -> Duration {
        Duration::ZERO
    }
}

/// Diagnostics collected from a single analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDiagnostics {
    /// Sub-pipeline for the start year.
    pub before: YearDiagnostics,
    /// Sub-pipeline for the end year.
    pub after: YearDiagnostics,
    /// Resampling onto a shared grid.
    pub alignment: StageDiagnostics,
    /// Differencing and class assignment.
    pub classification: StageDiagnostics,
    /// Statistical reduction.
    pub summary: StageDiagnostics,
    /// Total wall-clock duration of the analysis (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub totals: AnalysisSummary,
}

/// Diagnostics for the selection, loading and index stages of one year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearDiagnostics {
    /// Target year.
    pub year: i32,
    /// Catalog search and ranking.
    pub selection: StageDiagnostics,
    /// Band fetch, reprojection, clipping and masking.
    pub loading: StageDiagnostics,
    /// Vegetation index computation.
    pub index: StageDiagnostics,
    /// Best-observation merge, only when several scenes were selected.
    pub mosaic: Option<StageDiagnostics>,
}

impl YearDiagnostics {
    /// Wall-clock time of the whole sub-pipeline.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.selection.duration
            + self.loading.duration
            + self.index.duration
            + self.mosaic.as_ref().map_or(Duration::ZERO, |m| m.duration)
    }
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Catalog search and ranking.
    Selection {
        /// Scenes the catalog returned.
        candidates_returned: usize,
        /// Scenes that passed local filtering.
        candidates_eligible: usize,
        /// Chosen scene ids, best first.
        scene_ids: Vec<String>,
        /// Cloud cover of the best scene.
        cloud_cover: f64,
    },
    /// Band loading, summed over the selected scenes.
    Loading {
        /// Output grid rows of the primary scene.
        rows: usize,
        /// Output grid columns of the primary scene.
        cols: usize,
        /// Cells inside the area with data in both bands.
        clipped_pixels: usize,
        /// Cells of `clipped_pixels` removed as cloud or shadow.
        cloud_masked_pixels: usize,
    },
    /// Index computation, summed over the selected scenes.
    Index {
        /// Cells with a valid index value.
        valid: usize,
        /// Total cells.
        cells: usize,
    },
    /// Best-observation merge.
    Mosaic {
        /// Scenes merged.
        scenes: usize,
        /// Valid cells of the primary scene alone.
        valid_before: usize,
        /// Valid cells after filling from the other scenes.
        valid_after: usize,
    },
    /// Temporal alignment.
    Alignment {
        /// Whether either raster was resampled.
        resampled: bool,
        /// Shared grid rows.
        rows: usize,
        /// Shared grid columns.
        cols: usize,
    },
    /// Change classification.
    Classification {
        /// Cells valid in both years.
        valid: usize,
        /// Cells invalid in either year.
        invalid: usize,
    },
    /// Statistics.
    Summary {
        /// Valid cells reduced.
        total_valid: u64,
    },
}

/// High-level summary counts for the whole analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    /// Shared grid rows.
    pub rows: usize,
    /// Shared grid columns.
    pub cols: usize,
    /// Cells classified.
    pub valid_pixels: u64,
    /// Cells excluded.
    pub invalid_pixels: u64,
    /// Scenes behind the before raster.
    pub before_scenes: Vec<String>,
    /// Scenes behind the after raster.
    pub after_scenes: Vec<String>,
}

impl AnalysisDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Analysis Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Grid: {}x{} ({} valid, {} invalid)",
            self.totals.rows,
            self.totals.cols,
            self.totals.valid_pixels,
            self.totals.invalid_pixels,
        ));
        lines.push(format!(
            "Scenes: {} -> {}",
            self.totals.before_scenes.join("+"),
            self.totals.after_scenes.join("+"),
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages: Vec<(String, &StageDiagnostics)> = Vec::new();
        for year in [&self.before, &self.after] {
            stages.push((format!("{} Selection", year.year), &year.selection));
            stages.push((format!("{} Loading", year.year), &year.loading));
            stages.push((format!("{} Index", year.year), &year.index));
            if let Some(ref m) = year.mosaic {
                stages.push((format!("{} Mosaic", year.year), m));
            }
        }
        stages.push(("Alignment".to_string(), &self.alignment));
        stages.push(("Classification".to_string(), &self.classification));
        stages.push(("Summary".to_string(), &self.summary));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Year sub-pipelines: {:.3}ms + {:.3}ms",
            duration_ms(self.before.duration()),
            duration_ms(self.after.duration()),
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: usize, whole: usize) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64 * 100.0
    } else {
        0.0
    }
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Selection {
            candidates_returned,
            candidates_eligible,
            scene_ids,
            cloud_cover,
        } => format!(
            "{candidates_returned} returned, {candidates_eligible} eligible -> {} ({:.1}% cloud)",
            scene_ids.join("+"),
            cloud_cover * 100.0,
        ),
        StageMetrics::Loading {
            rows,
            cols,
            clipped_pixels,
            cloud_masked_pixels,
        } => format!(
            "{rows}x{cols}, {clipped_pixels} inside, {cloud_masked_pixels} clouded ({:.1}%)",
            percent(*cloud_masked_pixels, *clipped_pixels),
        ),
        StageMetrics::Index { valid, cells } => {
            format!("{valid}/{cells} valid ({:.1}%)", percent(*valid, *cells))
        }
        StageMetrics::Mosaic {
            scenes,
            valid_before,
            valid_after,
        } => format!("{scenes} scenes, valid {valid_before}->{valid_after}"),
        StageMetrics::Alignment {
            resampled,
            rows,
            cols,
        } => {
            let how = if *resampled { "resampled" } else { "shared grid" };
            format!("{how} {rows}x{cols}")
        }
        StageMetrics::Classification { valid, invalid } => {
            format!("{valid} classified, {invalid} invalid")
        }
        StageMetrics::Summary { total_valid } => format!("{total_valid} cells reduced"),
    }
}

/// Run the analysis, timing every stage with `clock`.
///
/// Produces exactly the result of [`crate::analyze`] plus the
/// diagnostics.
///
/// # Errors
///
/// Returns the [`AnalysisError`] of the first failing stage.
pub fn analyze_with_diagnostics<C: Clock>(
    request: AnalysisRequest,
    config: AnalysisConfig,
    catalog: &dyn Catalog,
    decoder: &dyn AssetDecoder,
    clock: &C,
) -> Result<(AnalysisResult, AnalysisDiagnostics), AnalysisError> {
    let start = clock.now();

    let (acquired, [before, after]) =
        Pipeline::new(request, config).acquire_timed(catalog, decoder, clock)?;

    let t = clock.now();
    let aligned = acquired.align()?;
    let alignment = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: aligned.metrics(),
    };

    let t = clock.now();
    let classified = aligned.classify()?;
    let classification = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: classified.metrics(),
    };

    let t = clock.now();
    let summarized = classified.summarize();
    let summary = StageDiagnostics {
        duration: clock.elapsed(&t),
        metrics: summarized.metrics(),
    };

    let result = summarized.into_result();
    let (rows, cols) = result.change_map.spec.shape();
    let totals = AnalysisSummary {
        rows,
        cols,
        valid_pixels: result.statistics.total_valid,
        invalid_pixels: result.statistics.total_invalid,
        before_scenes: result.change_map.before_scenes.clone(),
        after_scenes: result.change_map.after_scenes.clone(),
    };

    let diagnostics = AnalysisDiagnostics {
        before,
        after,
        alignment,
        classification,
        summary,
        total_duration: clock.elapsed(&start),
        totals,
    };
    Ok((result, diagnostics))
}
