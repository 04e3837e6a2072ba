//! Asset selection: find the best scene(s) for one target year.
//!
//! The catalog is queried once for everything intersecting the area's
//! bounding box within the seasonal window. Candidates are then filtered
//! locally (date, collection, cloud ceiling, footprint coverage) and
//! ranked by ascending cloud cover, with ties broken by distance from the
//! middle of the window.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use geo::Polygon;
use serde::{Deserialize, Serialize};

use crate::aoi::AreaOfInterest;
use crate::crs::Crs;
use crate::raster::Extent;
use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
use crate::types::PipelineError;

/// Slack when comparing coverage fractions computed from polygon areas.
const COVERAGE_TOLERANCE: f64 = 1e-9;

/// Calendar window searched inside each target year. Both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Season {
    /// First month (1-12).
    pub start_month: u32,
    /// First day of `start_month`.
    pub start_day: u32,
    /// Last month (1-12).
    pub end_month: u32,
    /// Last day of `end_month`.
    pub end_day: u32,
}

/// Northern-hemisphere summer, June 1 to August 31.
impl Default for Season {
    fn default() -> Self {
        Self {
            start_month: 6,
            start_day: 1,
            end_month: 8,
            end_day: 31,
        }
    }
}

impl Season {
    /// The whole calendar year.
    #[must_use]
    pub const fn full_year() -> Self {
        Self {
            start_month: 1,
            start_day: 1,
            end_month: 12,
            end_day: 31,
        }
    }

    /// Concrete date window for `year`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either end is not a real
    /// date in `year` or the window ends before it starts.
    pub fn window(&self, year: i32) -> Result<DateWindow, PipelineError> {
        let start = NaiveDate::from_ymd_opt(year, self.start_month, self.start_day);
        let end = NaiveDate::from_ymd_opt(year, self.end_month, self.end_day);
        match (start, end) {
            (Some(start), Some(end)) if start <= end => Ok(DateWindow { start, end }),
            (Some(_), Some(_)) => Err(PipelineError::InvalidConfig(format!(
                "season ends before it starts ({}-{} > {}-{})",
                self.start_month, self.start_day, self.end_month, self.end_day
            ))),
            _ => Err(PipelineError::InvalidConfig(format!(
                "season {}-{} to {}-{} is not a valid date range in {year}",
                self.start_month, self.start_day, self.end_month, self.end_day
            ))),
        }
    }
}

/// Inclusive range of acquisition dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    /// First day.
    pub start: NaiveDate,
    /// Last day.
    pub end: NaiveDate,
}

impl DateWindow {
    /// Middle day of the window, rounded towards `start`.
    #[must_use]
    pub fn midpoint(&self) -> NaiveDate {
        let half = (self.end - self.start).num_days() / 2;
        self.start + chrono::Duration::days(half)
    }

    /// Whether `date` lies within the window.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Location of one asset of a scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Asset key in the catalog item (e.g. `nir`, `red`, `scl`).
    pub key: String,
    /// Where the asset can be fetched from.
    pub href: String,
}

/// One catalog entry. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneCandidate {
    id: String,
    collection: String,
    acquired: NaiveDate,
    cloud_cover: f64,
    footprint: Polygon<f64>,
    crs: Crs,
    assets: BTreeMap<String, AssetRef>,
}

impl SceneCandidate {
    /// Describe a scene. `cloud_cover` is a fraction and is clamped to
    /// `[0, 1]`; a non-finite value counts as fully clouded.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        collection: impl Into<String>,
        acquired: NaiveDate,
        cloud_cover: f64,
        footprint: Polygon<f64>,
        crs: Crs,
    ) -> Self {
        let cloud_cover = if cloud_cover.is_finite() {
            cloud_cover.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self {
            id: id.into(),
            collection: collection.into(),
            acquired,
            cloud_cover,
            footprint,
            crs,
            assets: BTreeMap::new(),
        }
    }

    /// Attach an asset.
    #[must_use]
    pub fn with_asset(mut self, key: impl Into<String>, href: impl Into<String>) -> Self {
        let key = key.into();
        self.assets.insert(
            key.clone(),
            AssetRef {
                key,
                href: href.into(),
            },
        );
        self
    }

    /// Catalog identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Collection (sensor family) identifier.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Acquisition date.
    #[must_use]
    pub const fn acquired(&self) -> NaiveDate {
        self.acquired
    }

    /// Cloud-cover fraction in `[0, 1]`.
    #[must_use]
    pub const fn cloud_cover(&self) -> f64 {
        self.cloud_cover
    }

    /// Lon/lat footprint.
    #[must_use]
    pub const fn footprint(&self) -> &Polygon<f64> {
        &self.footprint
    }

    /// Native coordinate reference system of the scene's assets.
    #[must_use]
    pub const fn crs(&self) -> Crs {
        self.crs
    }

    /// Asset by key.
    #[must_use]
    pub fn asset(&self, key: &str) -> Option<&AssetRef> {
        self.assets.get(key)
    }

    /// All assets, ordered by key.
    pub fn assets(&self) -> impl Iterator<Item = &AssetRef> {
        self.assets.values()
    }
}

/// Parameters of one catalog search.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    /// Collection to search.
    pub collection: String,
    /// Lon/lat bounding box the footprints must intersect.
    pub bbox: Extent,
    /// Acquisition dates of interest.
    pub window: DateWindow,
    /// Optional cloud-cover ceiling (fraction).
    pub max_cloud_cover: Option<f64>,
    /// How long the catalog may take to answer.
    pub timeout: Duration,
}

/// Failure reported by a [`Catalog`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The catalog could not be reached.
    #[error("catalog unreachable: {0}")]
    Unavailable(String),
    /// The catalog did not answer in time.
    #[error("catalog timed out after {0:?}")]
    Timeout(Duration),
    /// The catalog refused the query. Not retried.
    #[error("catalog rejected the query: {0}")]
    Rejected(String),
}

impl Retryable for CatalogError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// An imagery catalog.
///
/// Implementations may be approximate (for example only filtering by
/// bounding box); the selector re-checks every constraint locally.
pub trait Catalog: Sync {
    /// All scenes matching `query`, in any order.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    fn search(&self, query: &CatalogQuery) -> Result<Vec<SceneCandidate>, CatalogError>;
}

/// Candidate filtering and ranking options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Fraction of the area a footprint must cover to count as full
    /// coverage. When no candidate reaches it, the best partial coverage
    /// wins.
    pub min_coverage: f64,

    /// Discard scenes cloudier than this fraction.
    pub max_cloud_cover: Option<f64>,

    /// Number of top-ranked scenes to merge per year. `1` disables
    /// mosaicking.
    pub mosaic_scenes: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_coverage: 1.0,
            max_cloud_cover: None,
            mosaic_scenes: 1,
        }
    }
}

impl SelectionConfig {
    /// Check every field is in range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.min_coverage > 0.0 && self.min_coverage <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "selection.min_coverage must be in (0, 1], got {}",
                self.min_coverage
            )));
        }
        if let Some(ceiling) = self.max_cloud_cover
            && !(0.0..=1.0).contains(&ceiling)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "selection.max_cloud_cover must be in [0, 1], got {ceiling}"
            )));
        }
        if self.mosaic_scenes == 0 {
            return Err(PipelineError::InvalidConfig(
                "selection.mosaic_scenes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A candidate that survived filtering, with its coverage of the area.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedScene {
    /// The catalog entry.
    pub scene: SceneCandidate,
    /// Fraction of the area of interest its footprint covers.
    pub coverage: f64,
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Window that was searched.
    pub window: DateWindow,
    /// Chosen scenes, best first. Never empty.
    pub scenes: Vec<RankedScene>,
    /// How many scenes the catalog returned.
    pub candidates_returned: usize,
    /// How many passed local filtering.
    pub candidates_eligible: usize,
}

impl Selection {
    /// The best-ranked scene.
    #[must_use]
    pub fn primary(&self) -> Option<&RankedScene> {
        self.scenes.first()
    }
}

/// Filter and order catalog candidates, best first.
///
/// A candidate is eligible when it was acquired inside `window`, belongs
/// to `collection`, does not exceed the cloud ceiling, and overlaps the
/// area at all. Eligible candidates reaching `min_coverage` are kept; if
/// none does, only those sharing the best partial coverage remain.
///
/// Order: cloud cover ascending, then distance from the window midpoint,
/// then acquisition date, then id. The last two keys make the order total
/// so the result never depends on catalog response order.
#[must_use]
pub fn rank_candidates(
    aoi: &AreaOfInterest,
    window: &DateWindow,
    collection: &str,
    candidates: Vec<SceneCandidate>,
    config: &SelectionConfig,
) -> Vec<RankedScene> {
    let ceiling = config.max_cloud_cover.unwrap_or(1.0);

    let eligible: Vec<RankedScene> = candidates
        .into_iter()
        .filter(|c| window.contains(c.acquired) && c.collection == collection)
        .filter(|c| c.cloud_cover <= ceiling)
        .filter_map(|scene| {
            let coverage = aoi.coverage_by(&scene.footprint);
            (coverage > 0.0).then_some(RankedScene { scene, coverage })
        })
        .collect();

    let full = config.min_coverage - COVERAGE_TOLERANCE;
    let mut ranked: Vec<RankedScene> = if eligible.iter().any(|r| r.coverage >= full) {
        eligible.into_iter().filter(|r| r.coverage >= full).collect()
    } else {
        let best = eligible.iter().map(|r| r.coverage).fold(0.0, f64::max);
        eligible
            .into_iter()
            .filter(|r| r.coverage >= best - COVERAGE_TOLERANCE)
            .collect()
    };

    let midpoint = window.midpoint();
    ranked.sort_by(|a, b| {
        let (a, b) = (&a.scene, &b.scene);
        a.cloud_cover
            .total_cmp(&b.cloud_cover)
            .then_with(|| {
                let da = (a.acquired - midpoint).num_days().abs();
                let db = (b.acquired - midpoint).num_days().abs();
                da.cmp(&db)
            })
            .then_with(|| a.acquired.cmp(&b.acquired))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Query the catalog and pick up to `config.mosaic_scenes` scenes.
///
/// # Errors
///
/// - [`PipelineError::CatalogUnavailable`] when the catalog kept failing
///   transiently or rejected the query.
/// - [`PipelineError::NoImageryFound`] when no candidate is eligible.
pub fn select_scenes(
    catalog: &dyn Catalog,
    aoi: &AreaOfInterest,
    window: DateWindow,
    collection: &str,
    config: &SelectionConfig,
    policy: &RetryPolicy,
) -> Result<Selection, PipelineError> {
    let query = CatalogQuery {
        collection: collection.to_string(),
        bbox: aoi.bounding_box(),
        window,
        max_cloud_cover: config.max_cloud_cover,
        timeout: policy.request_timeout,
    };

    let mut attempts = 0;
    let candidates = retry(policy, "catalog search", |attempt| {
        attempts = attempt;
        catalog.search(&query)
    })
    .map_err(|err| match err {
        RetryError::Exhausted { attempts, last } => PipelineError::CatalogUnavailable {
            attempts,
            reason: last.to_string(),
        },
        RetryError::Permanent(last) => PipelineError::CatalogUnavailable {
            attempts,
            reason: last.to_string(),
        },
    })?;

    let candidates_returned = candidates.len();
    let mut ranked = rank_candidates(aoi, &window, collection, candidates, config);
    let candidates_eligible = ranked.len();

    if ranked.is_empty() {
        return Err(PipelineError::NoImageryFound {
            collection: collection.to_string(),
            start: window.start,
            end: window.end,
        });
    }
    ranked.truncate(config.mosaic_scenes.max(1));

    if let Some(best) = ranked.first() {
        tracing::info!(
            scene = best.scene.id(),
            acquired = %best.scene.acquired(),
            cloud_cover = best.scene.cloud_cover(),
            coverage = best.coverage,
            candidates_returned,
            candidates_eligible,
            "selected scene"
        );
    }

    Ok(Selection {
        window,
        scenes: ranked,
        candidates_returned,
        candidates_eligible,
    })
}

/// Single best scene for the window.
///
/// # Errors
///
/// See [`select_scenes`].
pub fn select_scene(
    catalog: &dyn Catalog,
    aoi: &AreaOfInterest,
    window: DateWindow,
    collection: &str,
    config: &SelectionConfig,
    policy: &RetryPolicy,
) -> Result<SceneCandidate, PipelineError> {
    let single = SelectionConfig {
        mosaic_scenes: 1,
        ..*config
    };
    let selection = select_scenes(catalog, aoi, window, collection, &single, policy)?;
    selection
        .scenes
        .into_iter()
        .next()
        .map(|ranked| ranked.scene)
        .ok_or_else(|| PipelineError::NoImageryFound {
            collection: collection.to_string(),
            start: window.start,
            end: window.end,
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::polygon;

    use super::*;
    use crate::testing::{FakeCatalog, date, fast_retry, test_aoi, wide_footprint};

    const COLLECTION: &str = "sentinel-2-l2a";

    fn scene(id: &str, acquired: NaiveDate, cloud: f64) -> SceneCandidate {
        SceneCandidate::new(id, COLLECTION, acquired, cloud, wide_footprint(), Crs::Wgs84)
    }

    fn summer(year: i32) -> DateWindow {
        Season::default().window(year).unwrap()
    }

    #[test]
    fn default_season_is_summer() {
        let w = summer(2020);
        assert_eq!(w.start, date(2020, 6, 1));
        assert_eq!(w.end, date(2020, 8, 31));
        assert_eq!(w.midpoint(), date(2020, 7, 16));
        assert!(w.contains(date(2020, 8, 31)));
        assert!(!w.contains(date(2020, 9, 1)));
    }

    #[test]
    fn invalid_season_is_rejected() {
        let backwards = Season {
            start_month: 9,
            start_day: 1,
            end_month: 6,
            end_day: 1,
        };
        assert!(matches!(
            backwards.window(2020),
            Err(PipelineError::InvalidConfig(_))
        ));
        let feb30 = Season {
            start_month: 2,
            start_day: 30,
            ..Season::default()
        };
        assert!(feb30.window(2020).is_err());
    }

    #[test]
    fn cloud_cover_is_clamped() {
        assert!((scene("a", date(2020, 7, 1), 1.7).cloud_cover() - 1.0).abs() < f64::EPSILON);
        assert!((scene("a", date(2020, 7, 1), f64::NAN).cloud_cover() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ranks_by_cloud_then_midpoint_distance() {
        let candidates = vec![
            scene("cloudy", date(2020, 7, 16), 0.30),
            scene("clear-early", date(2020, 6, 2), 0.05),
            scene("clear-mid", date(2020, 7, 20), 0.05),
            scene("clearest", date(2020, 8, 30), 0.01),
        ];
        let ranked = rank_candidates(
            &test_aoi(),
            &summer(2020),
            COLLECTION,
            candidates,
            &SelectionConfig::default(),
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.scene.id()).collect();
        assert_eq!(ids, ["clearest", "clear-mid", "clear-early", "cloudy"]);
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let a = scene("a", date(2020, 7, 10), 0.1);
        let b = scene("b", date(2020, 7, 22), 0.1);
        let aoi = test_aoi();
        let config = SelectionConfig::default();
        let first = rank_candidates(&aoi, &summer(2020), COLLECTION, vec![a.clone(), b.clone()], &config);
        let second = rank_candidates(&aoi, &summer(2020), COLLECTION, vec![b, a], &config);
        assert_eq!(first, second);
        // Both 6 days from the midpoint; earlier date wins.
        assert_eq!(first[0].scene.id(), "a");
    }

    #[test]
    fn filters_window_collection_and_ceiling() {
        let candidates = vec![
            scene("out-of-window", date(2020, 9, 15), 0.0),
            SceneCandidate::new("landsat", "landsat-c2-l2", date(2020, 7, 1), 0.0, wide_footprint(), Crs::Wgs84),
            scene("too-cloudy", date(2020, 7, 1), 0.5),
            scene("ok", date(2020, 7, 1), 0.1),
        ];
        let config = SelectionConfig {
            max_cloud_cover: Some(0.2),
            ..SelectionConfig::default()
        };
        let ranked = rank_candidates(&test_aoi(), &summer(2020), COLLECTION, candidates, &config);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].scene.id(), "ok");
    }

    #[test]
    fn full_coverage_beats_clearer_partial() {
        // Covers only the western half of the test area.
        let half = polygon![
            (x: -104.0, y: 43.9), (x: -103.95, y: 43.9),
            (x: -103.95, y: 44.0), (x: -104.0, y: 44.0)
        ];
        let candidates = vec![
            SceneCandidate::new("partial", COLLECTION, date(2020, 7, 16), 0.0, half, Crs::Wgs84),
            scene("full", date(2020, 7, 16), 0.4),
        ];
        let ranked = rank_candidates(
            &test_aoi(),
            &summer(2020),
            COLLECTION,
            candidates,
            &SelectionConfig::default(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].scene.id(), "full");
    }

    #[test]
    fn falls_back_to_best_partial_coverage() {
        let half = polygon![
            (x: -104.0, y: 43.9), (x: -103.95, y: 43.9),
            (x: -103.95, y: 44.0), (x: -104.0, y: 44.0)
        ];
        let sliver = polygon![
            (x: -104.0, y: 43.9), (x: -103.97, y: 43.9),
            (x: -103.97, y: 44.0), (x: -104.0, y: 44.0)
        ];
        let candidates = vec![
            SceneCandidate::new("sliver", COLLECTION, date(2020, 7, 16), 0.0, sliver, Crs::Wgs84),
            SceneCandidate::new("half", COLLECTION, date(2020, 7, 16), 0.3, half, Crs::Wgs84),
        ];
        let ranked = rank_candidates(
            &test_aoi(),
            &summer(2020),
            COLLECTION,
            candidates,
            &SelectionConfig::default(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].scene.id(), "half");
        assert!((ranked[0].coverage - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_catalog_is_no_imagery_found() {
        let catalog = FakeCatalog::new(Vec::new());
        let err = select_scene(
            &catalog,
            &test_aoi(),
            summer(2020),
            COLLECTION,
            &SelectionConfig::default(),
            &fast_retry(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoImageryFound { .. }));
        assert_eq!(catalog.calls(), 1);
    }

    #[test]
    fn transient_catalog_failures_are_retried() {
        let catalog = FakeCatalog::new(vec![scene("s", date(2020, 7, 1), 0.1)]).failing_times(2);
        let chosen = select_scene(
            &catalog,
            &test_aoi(),
            summer(2020),
            COLLECTION,
            &SelectionConfig::default(),
            &fast_retry(),
        )
        .unwrap();
        assert_eq!(chosen.id(), "s");
        assert_eq!(catalog.calls(), 3);
    }

    #[test]
    fn unreachable_catalog_is_catalog_unavailable() {
        let catalog = FakeCatalog::new(Vec::new()).always_failing();
        let err = select_scene(
            &catalog,
            &test_aoi(),
            summer(2020),
            COLLECTION,
            &SelectionConfig::default(),
            &fast_retry(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CatalogUnavailable { attempts: 3, .. }
        ));
        assert_eq!(catalog.calls(), 3);
    }

    #[test]
    fn returns_top_k_for_mosaicking() {
        let catalog = FakeCatalog::new(vec![
            scene("c", date(2020, 7, 1), 0.3),
            scene("a", date(2020, 7, 1), 0.1),
            scene("b", date(2020, 7, 1), 0.2),
        ]);
        let config = SelectionConfig {
            mosaic_scenes: 2,
            ..SelectionConfig::default()
        };
        let selection = select_scenes(
            &catalog,
            &test_aoi(),
            summer(2020),
            COLLECTION,
            &config,
            &fast_retry(),
        )
        .unwrap();
        let ids: Vec<&str> = selection.scenes.iter().map(|r| r.scene.id()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(selection.candidates_returned, 3);
        assert_eq!(selection.candidates_eligible, 3);
    }

    #[test]
    fn selection_config_validation() {
        assert!(SelectionConfig::default().validate().is_ok());
        let bad = SelectionConfig {
            min_coverage: 0.0,
            ..SelectionConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = SelectionConfig {
            max_cloud_cover: Some(20.0),
            ..SelectionConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = SelectionConfig {
            mosaic_scenes: 0,
            ..SelectionConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
