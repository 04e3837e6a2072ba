//! Hand-built analysis results shared by the serializer tests.

use chrono::NaiveDate;
use ndarray::array;
use verdure_pipeline::classify::classify;
use verdure_pipeline::stats::summarize;
use verdure_pipeline::{
    AnalysisResult, ChangeStatistics, Crs, GeoTransform, GridSpec, IndexRaster, MaskedGrid,
    Thresholds,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn result_from(spec: GridSpec, before: MaskedGrid, after: MaskedGrid) -> AnalysisResult {
    let before = IndexRaster {
        spec,
        grid: before,
        acquired: date(2018, 7, 15),
        cloud_cover: 0.04,
        scenes: vec!["S2B_2018".to_string()],
    };
    let after = IndexRaster {
        spec,
        grid: after,
        acquired: date(2023, 7, 20),
        cloud_cover: 0.12,
        scenes: vec!["S2A_2023".to_string()],
    };
    let change_map = classify(&before, &after, &Thresholds::default()).unwrap();
    let statistics = summarize(&change_map);
    AnalysisResult {
        change_map,
        statistics,
        before,
        after,
    }
}

/// 2x3 UTM grid of 10 m cells. Deltas, row-major:
/// `-0.4, -0.02, +0.3, 0.0, -0.1, invalid`.
pub fn sample_result() -> AnalysisResult {
    let spec = GridSpec::new(
        Crs::Utm {
            zone: 13,
            north: true,
        },
        GeoTransform::new(500_000.0, 4_870_000.0, 10.0, -10.0),
        2,
        3,
    );
    let before = MaskedGrid::all_valid(array![[0.6, 0.6, 0.6], [0.5, 0.5, 0.5]]);
    let after = MaskedGrid::new(
        array![[0.2, 0.58, 0.9], [0.5, 0.4, 0.0]],
        array![[true, true, true], [true, true, false]],
    )
    .unwrap();
    result_from(spec, before, after)
}

/// 2x2 WGS84 grid where the later acquisition is entirely invalid.
pub fn empty_result() -> AnalysisResult {
    let spec = GridSpec::new(Crs::Wgs84, GeoTransform::new(10.0, -3.0, 0.01, -0.01), 2, 2);
    result_from(
        spec,
        MaskedGrid::all_valid(array![[0.5, 0.5], [0.5, 0.5]]),
        MaskedGrid::invalid(2, 2),
    )
}

pub fn empty_statistics() -> ChangeStatistics {
    empty_result().statistics
}
