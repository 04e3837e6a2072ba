//! Statistical reduction of a change map.
//!
//! All sums use compensated (Neumaier) summation over deltas sorted with
//! `f64::total_cmp`, so the result depends only on the multiset of cell
//! values, never on traversal order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::{ChangeClass, ChangeMap};

/// Unit of the `area` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaUnit {
    /// Projected CRS.
    SquareMetres,
    /// Geographic CRS. Not an equal-area measure.
    SquareDegrees,
}

impl fmt::Display for AreaUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SquareMetres => f.write_str("m²"),
            Self::SquareDegrees => f.write_str("deg²"),
        }
    }
}

/// Summary of one change class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    /// The class.
    pub class: ChangeClass,
    /// Cells in the class.
    pub pixel_count: u64,
    /// `pixel_count` times the cell area.
    pub area: f64,
    /// Share of valid cells, 0-100.
    pub percentage: f64,
    /// Mean index delta of the class.
    pub mean_delta: f64,
    /// Sample standard deviation of the delta (0 below two cells).
    pub std_delta: f64,
}

/// Distribution of index deltas over all valid cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSummary {
    /// Arithmetic mean.
    pub mean: f64,
    /// Median.
    pub median: f64,
    /// Sample standard deviation.
    pub std: f64,
    /// Smallest delta.
    pub min: f64,
    /// Largest delta.
    pub max: f64,
    /// Cells with `delta < 0`.
    pub decrease_count: u64,
    /// Cells with `delta > 0`.
    pub increase_count: u64,
    /// `decrease_count` as a share of valid cells, 0-100.
    pub decrease_percentage: f64,
    /// `increase_count` as a share of valid cells, 0-100.
    pub increase_percentage: f64,
}

/// Area statistics of a change map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStatistics {
    /// One entry per valid class, loss to gain. Always five entries;
    /// classes a three-band threshold set never produces are zero.
    pub classes: Vec<ClassStatistics>,
    /// Cells valid in both acquisitions.
    pub total_valid: u64,
    /// Cells excluded from every statistic.
    pub total_invalid: u64,
    /// Area of one cell.
    pub pixel_area: f64,
    /// Unit of `pixel_area` and every `area`.
    pub area_unit: AreaUnit,
    /// Distribution over all valid cells.
    pub overall: DeltaSummary,
}

impl ChangeStatistics {
    /// Statistics of one class.
    #[must_use]
    pub fn class(&self, class: ChangeClass) -> Option<&ClassStatistics> {
        self.classes.iter().find(|c| c.class == class)
    }

    /// Total valid area.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn valid_area(&self) -> f64 {
        self.total_valid as f64 * self.pixel_area
    }
}

/// Reduce a change map to per-class and overall statistics.
///
/// Never fails: a map with no valid cell yields zero counts, areas,
/// percentages, and moments.
#[must_use]
pub fn summarize(map: &ChangeMap) -> ChangeStatistics {
    let mut per_class: [Vec<f64>; 5] = Default::default();
    let mut all = Vec::with_capacity(map.valid_count());
    let mut total_invalid = 0_u64;

    for (&class, &delta) in map.classes.iter().zip(map.delta.values()) {
        match class_slot(class) {
            Some(slot) => {
                per_class[slot].push(delta);
                all.push(delta);
            }
            None => total_invalid += 1,
        }
    }

    let total_valid = all.len() as u64;
    let pixel_area = map.spec.pixel_area();
    let area_unit = if map.spec.crs.is_projected() {
        AreaUnit::SquareMetres
    } else {
        AreaUnit::SquareDegrees
    };

    let classes = ChangeClass::VALID
        .iter()
        .zip(per_class.iter_mut())
        .map(|(&class, deltas)| {
            deltas.sort_by(f64::total_cmp);
            let count = deltas.len() as u64;
            #[allow(clippy::cast_precision_loss)]
            let area = count as f64 * pixel_area;
            ClassStatistics {
                class,
                pixel_count: count,
                area,
                percentage: percentage(count, total_valid),
                mean_delta: mean(deltas),
                std_delta: sample_std(deltas),
            }
        })
        .collect();

    all.sort_by(f64::total_cmp);
    let decrease_count = all.iter().filter(|&&d| d < 0.0).count() as u64;
    let increase_count = all.iter().filter(|&&d| d > 0.0).count() as u64;
    let overall = DeltaSummary {
        mean: mean(&all),
        median: median(&all),
        std: sample_std(&all),
        min: all.first().copied().unwrap_or(0.0),
        max: all.last().copied().unwrap_or(0.0),
        decrease_count,
        increase_count,
        decrease_percentage: percentage(decrease_count, total_valid),
        increase_percentage: percentage(increase_count, total_valid),
    };

    tracing::debug!(total_valid, total_invalid, "summarized change map");

    ChangeStatistics {
        classes,
        total_valid,
        total_invalid,
        pixel_area,
        area_unit,
        overall,
    }
}

const fn class_slot(class: ChangeClass) -> Option<usize> {
    match class {
        ChangeClass::SignificantLoss => Some(0),
        ChangeClass::ModerateLoss => Some(1),
        ChangeClass::Stable => Some(2),
        ChangeClass::ModerateGain => Some(3),
        ChangeClass::SignificantGain => Some(4),
        ChangeClass::Invalid => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

/// Neumaier compensated sum.
fn stable_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0_f64;
    let mut compensation = 0.0_f64;
    for v in values {
        let t = sum + v;
        if sum.abs() >= v.abs() {
            compensation += (sum - t) + v;
        } else {
            compensation += (v - t) + sum;
        }
        sum = t;
    }
    sum + compensation
}

#[allow(clippy::cast_precision_loss)]
fn mean(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        0.0
    } else {
        stable_sum(sorted.iter().copied()) / sorted.len() as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn sample_std(sorted: &[f64]) -> f64 {
    if sorted.len() < 2 {
        return 0.0;
    }
    let m = mean(sorted);
    let ss = stable_sum(sorted.iter().map(|v| (v - m) * (v - m)));
    (ss / (sorted.len() - 1) as f64).sqrt()
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => f64::midpoint(sorted[n / 2 - 1], sorted[n / 2]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    use super::*;
    use crate::classify::{Thresholds, classify};
    use crate::raster::MaskedGrid;
    use crate::testing::{date, index_raster};

    fn change_map(before: Array2<f64>, after: Array2<f64>) -> ChangeMap {
        let b = index_raster("b", date(2018, 7, 1), before);
        let a = index_raster("a", date(2023, 7, 1), after);
        classify(&b, &a, &Thresholds::default()).unwrap()
    }

    #[test]
    fn per_class_counts_and_moments() {
        let map = change_map(
            array![[0.6, 0.6, 0.6], [0.6, 0.6, 0.6]],
            array![[0.0, 0.1, 0.6], [0.62, 0.7, 0.9]],
        );
        let stats = summarize(&map);
        assert_eq!(stats.total_valid, 6);
        assert_eq!(stats.total_invalid, 0);

        let loss = stats.class(ChangeClass::SignificantLoss).unwrap();
        assert_eq!(loss.pixel_count, 2);
        assert_relative_eq!(loss.mean_delta, -0.55, epsilon = 1e-12);
        // Deltas -0.6 and -0.5: sample std = 0.05 * sqrt(2).
        assert_relative_eq!(loss.std_delta, 0.05 * 2f64.sqrt(), epsilon = 1e-12);

        let stable = stats.class(ChangeClass::Stable).unwrap();
        assert_eq!(stable.pixel_count, 2);
        assert_eq!(stats.class(ChangeClass::ModerateGain).unwrap().pixel_count, 1);
        assert_eq!(stats.class(ChangeClass::SignificantGain).unwrap().pixel_count, 1);
        assert_eq!(stats.class(ChangeClass::ModerateLoss).unwrap().pixel_count, 0);
        assert_relative_eq!(stats.class(ChangeClass::ModerateGain).unwrap().std_delta, 0.0);
    }

    #[test]
    fn counts_and_percentages_sum() {
        let map = change_map(
            Array2::from_shape_fn((7, 9), |(r, c)| f64::from(u32::try_from(r * 9 + c).unwrap()) / 100.0),
            Array2::from_shape_fn((7, 9), |(r, c)| f64::from(u32::try_from((r * 31 + c * 17) % 63).unwrap()) / 100.0),
        );
        let stats = summarize(&map);
        let count: u64 = stats.classes.iter().map(|c| c.pixel_count).sum();
        assert_eq!(count, stats.total_valid);
        let pct: f64 = stats.classes.iter().map(|c| c.percentage).sum();
        assert_relative_eq!(pct, 100.0, epsilon = 1e-9);
        assert_eq!(stats.classes.len(), 5);
    }

    #[test]
    fn area_uses_pixel_resolution() {
        let map = change_map(array![[0.5, 0.5]], array![[0.5, 0.0]]);
        let stats = summarize(&map);
        assert_eq!(stats.area_unit, AreaUnit::SquareDegrees);
        assert_relative_eq!(stats.pixel_area, 1e-4, epsilon = 1e-15);
        let stable = stats.class(ChangeClass::Stable).unwrap();
        assert_relative_eq!(stable.area, 1e-4, epsilon = 1e-15);
        assert_relative_eq!(stable.percentage, 50.0);
        assert_relative_eq!(stats.valid_area(), 2e-4, epsilon = 1e-15);
    }

    #[test]
    fn overall_summary() {
        let map = change_map(
            array![[0.5, 0.5, 0.5, 0.5]],
            array![[0.1, 0.5, 0.6, 0.9]],
        );
        let o = summarize(&map).overall;
        assert_relative_eq!(o.mean, 0.025, epsilon = 1e-12);
        assert_relative_eq!(o.median, 0.05, epsilon = 1e-12);
        assert_relative_eq!(o.min, -0.4, epsilon = 1e-12);
        assert_relative_eq!(o.max, 0.4, epsilon = 1e-12);
        assert_eq!(o.decrease_count, 1);
        assert_eq!(o.increase_count, 2);
        assert_relative_eq!(o.decrease_percentage, 25.0);
        assert_relative_eq!(o.increase_percentage, 50.0);
    }

    #[test]
    fn fully_invalid_map_is_all_zero() {
        let mut map = change_map(array![[0.5, 0.5]], array![[0.5, 0.0]]);
        map.delta = MaskedGrid::invalid(1, 2);
        map.classes.fill(ChangeClass::Invalid);
        let stats = summarize(&map);
        assert_eq!(stats.total_valid, 0);
        assert_eq!(stats.total_invalid, 2);
        for c in &stats.classes {
            assert_eq!(c.pixel_count, 0);
            assert_relative_eq!(c.percentage, 0.0);
            assert_relative_eq!(c.mean_delta, 0.0);
            assert!(c.std_delta.is_finite());
        }
        assert_eq!(stats.overall, DeltaSummary::default());
    }

    #[test]
    fn result_is_independent_of_cell_order() {
        let before = Array2::from_elem((3, 4), 0.5);
        let after = array![[0.1, 0.33, 0.7, 0.52], [0.49, 0.05, 0.91, 0.3], [0.6, 0.61, 0.2, 0.44]];
        let mut reversed = after.clone();
        reversed.invert_axis(ndarray::Axis(0));
        reversed.invert_axis(ndarray::Axis(1));
        let a = summarize(&change_map(before.clone(), after));
        let b = summarize(&change_map(before, reversed.as_standard_layout().to_owned()));
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn neumaier_sum_keeps_small_terms() {
        assert_relative_eq!(stable_sum([1e16, 1.0, -1e16]), 1.0);
    }
}
