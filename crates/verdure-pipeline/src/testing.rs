//! In-memory collaborators and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use geo::{BoundingRect, Polygon, polygon};
use ndarray::Array2;

use crate::aoi::AreaOfInterest;
use crate::crs::Crs;
use crate::load::{AssetDecoder, DecodeError, DecodedBand, DecodedMask, PixelQuality};
use crate::raster::{GeoTransform, GridSpec, IndexRaster, MaskedGrid};
use crate::retry::RetryPolicy;
use crate::select::{AssetRef, Catalog, CatalogError, CatalogQuery, SceneCandidate};
use crate::types::Band;

pub const COLLECTION: &str = "sentinel-2-l2a";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Three attempts, no sleeping.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        request_timeout: Duration::from_secs(1),
    }
}

/// 0.06 x 0.06 degree square covering cells 2..8 of [`test_spec`].
pub fn test_aoi() -> AreaOfInterest {
    AreaOfInterest::from_bbox(-103.98, 43.92, -103.92, 43.98).unwrap()
}

/// Footprint comfortably containing [`test_aoi`].
pub fn wide_footprint() -> Polygon<f64> {
    polygon![
        (x: -104.5, y: 43.5),
        (x: -103.5, y: 43.5),
        (x: -103.5, y: 44.5),
        (x: -104.5, y: 44.5),
    ]
}

fn wgs84_spec(rows: usize, cols: usize) -> GridSpec {
    GridSpec::new(
        Crs::Wgs84,
        GeoTransform::new(-104.0, 44.0, 0.01, -0.01),
        rows,
        cols,
    )
}

/// 10 x 10 WGS84 grid, 0.01 degree cells, upper-left at (-104, 44).
pub fn test_spec() -> GridSpec {
    wgs84_spec(10, 10)
}

/// A decoded band of constant reflectance on [`test_spec`].
pub fn uniform_band(value: f64) -> DecodedBand {
    DecodedBand {
        spec: test_spec(),
        values: Array2::from_elem((10, 10), value),
        nodata: None,
        quality: None,
    }
}

/// Scene in mid-July of `year` with `nir` and `red` assets at `{id}/{key}`.
pub fn test_scene(id: &str, year: i32, cloud_cover: f64) -> SceneCandidate {
    SceneCandidate::new(
        id,
        COLLECTION,
        date(year, 7, 15),
        cloud_cover,
        wide_footprint(),
        Crs::Wgs84,
    )
    .with_asset("nir", format!("{id}/nir"))
    .with_asset("red", format!("{id}/red"))
}

/// Fully valid index raster on a WGS84 grid anchored like [`test_spec`].
pub fn index_raster(id: &str, acquired: NaiveDate, values: Array2<f64>) -> IndexRaster {
    let (rows, cols) = values.dim();
    IndexRaster {
        spec: wgs84_spec(rows, cols),
        grid: MaskedGrid::all_valid(values),
        acquired,
        cloud_cover: 0.1,
        scenes: vec![id.to_string()],
    }
}

/// Catalog answering from a fixed list, optionally failing first.
pub struct FakeCatalog {
    scenes: Vec<SceneCandidate>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn new(scenes: Vec<SceneCandidate>) -> Self {
        Self {
            scenes,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` searches with a transient error.
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_times(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Catalog for FakeCatalog {
    fn search(&self, query: &CatalogQuery) -> Result<Vec<SceneCandidate>, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CatalogError::Unavailable("connection reset".to_string()));
        }

        let ceiling = query.max_cloud_cover.unwrap_or(1.0);
        Ok(self
            .scenes
            .iter()
            .filter(|s| s.collection() == query.collection)
            .filter(|s| query.window.contains(s.acquired()))
            .filter(|s| s.cloud_cover() <= ceiling)
            .filter(|s| {
                s.footprint().bounding_rect().is_some_and(|r| {
                    r.min().x <= query.bbox.max_x
                        && r.max().x >= query.bbox.min_x
                        && r.min().y <= query.bbox.max_y
                        && r.max().y >= query.bbox.min_y
                })
            })
            .cloned()
            .collect())
    }
}

/// Decoder serving in-memory rasters keyed by href.
#[derive(Default)]
pub struct FakeDecoder {
    bands: HashMap<String, DecodedBand>,
    masks: HashMap<String, DecodedMask>,
    failures: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

fn href(scene: &SceneCandidate, key: &str) -> String {
    scene
        .asset(key)
        .map_or_else(|| format!("{}/{key}", scene.id()), |a| a.href.clone())
}

impl FakeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_band(mut self, scene: &SceneCandidate, key: &str, band: DecodedBand) -> Self {
        self.bands.insert(href(scene, key), band);
        self
    }

    /// Quality mask on [`test_spec`].
    pub fn with_mask(
        mut self,
        scene: &SceneCandidate,
        key: &str,
        classes: Array2<PixelQuality>,
    ) -> Self {
        self.masks.insert(
            href(scene, key),
            DecodedMask {
                spec: test_spec(),
                classes,
            },
        );
        self
    }

    /// Fail the next `n` fetches of `href` with a transient error.
    pub fn failing_times(self, href: &str, n: usize) -> Self {
        self.failures.lock().unwrap().insert(href.to_string(), n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self, asset: &AssetRef) -> Result<(), DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&asset.href)
            && *left > 0
        {
            *left -= 1;
            return Err(DecodeError::Transient(format!("{} timed out", asset.href)));
        }
        Ok(())
    }
}

impl AssetDecoder for FakeDecoder {
    fn decode_band(
        &self,
        asset: &AssetRef,
        _band: Band,
        _timeout: Duration,
    ) -> Result<DecodedBand, DecodeError> {
        self.check_failure(asset)?;
        self.bands
            .get(&asset.href)
            .cloned()
            .ok_or_else(|| DecodeError::Corrupt(format!("no raster at {}", asset.href)))
    }

    fn decode_mask(&self, asset: &AssetRef, _timeout: Duration) -> Result<DecodedMask, DecodeError> {
        self.check_failure(asset)?;
        self.masks
            .get(&asset.href)
            .cloned()
            .ok_or_else(|| DecodeError::Corrupt(format!("no mask at {}", asset.href)))
    }
}

/// One scene per year, 2018 and 2023, with uniform bands:
/// `(nir, red)` for each year.
pub fn two_year_fixture(before: (f64, f64), after: (f64, f64)) -> (FakeCatalog, FakeDecoder) {
    let a = test_scene("S2_2018", 2018, 0.05);
    let b = test_scene("S2_2023", 2023, 0.02);
    let decoder = FakeDecoder::new()
        .with_band(&a, "nir", uniform_band(before.0))
        .with_band(&a, "red", uniform_band(before.1))
        .with_band(&b, "nir", uniform_band(after.0))
        .with_band(&b, "red", uniform_band(after.1));
    (FakeCatalog::new(vec![a, b]), decoder)
}
