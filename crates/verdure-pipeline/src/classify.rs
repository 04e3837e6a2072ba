//! Change classification: signed index difference and threshold bands.

use std::fmt;

use chrono::NaiveDate;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::raster::{GridSpec, IndexRaster, MaskedGrid};
use crate::types::PipelineError;

/// Discrete change class of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    /// Large index decrease.
    SignificantLoss,
    /// Moderate index decrease.
    ModerateLoss,
    /// No meaningful change.
    Stable,
    /// Moderate index increase.
    ModerateGain,
    /// Large index increase.
    SignificantGain,
    /// Invalid in either acquisition. Excluded from statistics.
    Invalid,
}

impl ChangeClass {
    /// The five classes a valid cell can take, from loss to gain.
    pub const VALID: [Self; 5] = [
        Self::SignificantLoss,
        Self::ModerateLoss,
        Self::Stable,
        Self::ModerateGain,
        Self::SignificantGain,
    ];

    /// Whether this is one of [`ChangeClass::VALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Stable machine-readable name, as used in CSV output.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::SignificantLoss => "significant_loss",
            Self::ModerateLoss => "moderate_loss",
            Self::Stable => "stable",
            Self::ModerateGain => "moderate_gain",
            Self::SignificantGain => "significant_gain",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignificantLoss => f.write_str("Significant loss"),
            Self::ModerateLoss => f.write_str("Moderate loss"),
            Self::Stable => f.write_str("Stable"),
            Self::ModerateGain => f.write_str("Moderate gain"),
            Self::SignificantGain => f.write_str("Significant gain"),
            Self::Invalid => f.write_str("Invalid"),
        }
    }
}

/// Ordered band edges splitting index deltas into change classes.
///
/// Four edges `[e0, e1, e2, e3]` give five bands:
///
/// ```text
/// delta <= e0        SignificantLoss
/// e0 < delta <= e1   ModerateLoss
/// e1 < delta <  e2   Stable
/// e2 <= delta < e3   ModerateGain
/// delta >= e3        SignificantGain
/// ```
///
/// Two edges `[loss, gain]` give three bands: `delta <= loss` is
/// SignificantLoss, `delta >= gain` is SignificantGain, anything between
/// is Stable.
///
/// Edges are compared with an absolute tolerance of [`EDGE_TOLERANCE`], so
/// a difference of two index values that is an edge up to rounding
/// (`0.5 - 0.7`) lands on the closed side of that edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdEdges", into = "ThresholdEdges")]
pub struct Thresholds {
    edges: Vec<f64>,
}

/// Serialized form of [`Thresholds`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThresholdEdges {
    edges: Vec<f64>,
}

/// Slack applied at every band edge.
pub const EDGE_TOLERANCE: f64 = 1e-12;

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            edges: vec![-0.2, -0.05, 0.05, 0.2],
        }
    }
}

impl Thresholds {
    /// Validate band edges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] unless there are two or
    /// four finite, strictly increasing edges.
    pub fn try_new(edges: Vec<f64>) -> Result<Self, PipelineError> {
        if edges.len() != 2 && edges.len() != 4 {
            return Err(PipelineError::InvalidConfig(format!(
                "thresholds need 2 (three bands) or 4 (five bands) edges, got {}",
                edges.len()
            )));
        }
        if let Some(bad) = edges.iter().find(|e| !e.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold edge {bad} is not finite"
            )));
        }
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold edges must be strictly increasing: {edges:?}"
            )));
        }
        Ok(Self { edges })
    }

    /// Five bands.
    ///
    /// # Errors
    ///
    /// See [`Thresholds::try_new`].
    pub fn five_band(
        significant_loss: f64,
        moderate_loss: f64,
        moderate_gain: f64,
        significant_gain: f64,
    ) -> Result<Self, PipelineError> {
        Self::try_new(vec![
            significant_loss,
            moderate_loss,
            moderate_gain,
            significant_gain,
        ])
    }

    /// Three bands: loss, stable, gain.
    ///
    /// # Errors
    ///
    /// See [`Thresholds::try_new`].
    pub fn three_band(loss: f64, gain: f64) -> Result<Self, PipelineError> {
        Self::try_new(vec![loss, gain])
    }

    /// Band edges, ascending.
    #[must_use]
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of classes a valid cell can take (3 or 5).
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.edges.len() + 1
    }

    /// Class of a finite delta.
    #[must_use]
    pub fn classify(&self, delta: f64) -> ChangeClass {
        let at_or_below = |edge: f64| delta <= edge + EDGE_TOLERANCE;
        let at_or_above = |edge: f64| delta >= edge - EDGE_TOLERANCE;
        match *self.edges.as_slice() {
            [e0, e1, e2, e3] => {
                if at_or_below(e0) {
                    ChangeClass::SignificantLoss
                } else if at_or_below(e1) {
                    ChangeClass::ModerateLoss
                } else if at_or_above(e3) {
                    ChangeClass::SignificantGain
                } else if at_or_above(e2) {
                    ChangeClass::ModerateGain
                } else {
                    ChangeClass::Stable
                }
            }
            [loss, gain] => {
                if at_or_below(loss) {
                    ChangeClass::SignificantLoss
                } else if at_or_above(gain) {
                    ChangeClass::SignificantGain
                } else {
                    ChangeClass::Stable
                }
            }
            // Unreachable: edges are validated on construction.
            _ => ChangeClass::Invalid,
        }
    }
}

impl TryFrom<ThresholdEdges> for Thresholds {
    type Error = PipelineError;

    fn try_from(raw: ThresholdEdges) -> Result<Self, Self::Error> {
        Self::try_new(raw.edges)
    }
}

impl From<Thresholds> for ThresholdEdges {
    fn from(t: Thresholds) -> Self {
        Self { edges: t.edges }
    }
}

/// Per-cell change between two aligned index rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMap {
    /// Shared grid.
    pub spec: GridSpec,
    /// `after - before`, valid where both inputs are.
    pub delta: MaskedGrid,
    /// Class per cell. [`ChangeClass::Invalid`] exactly where `delta` is invalid.
    pub classes: Array2<ChangeClass>,
    /// Acquisition date of the earlier raster.
    pub before_date: NaiveDate,
    /// Acquisition date of the later raster.
    pub after_date: NaiveDate,
    /// Scenes behind the earlier raster.
    pub before_scenes: Vec<String>,
    /// Scenes behind the later raster.
    pub after_scenes: Vec<String>,
}

impl ChangeMap {
    /// Class at a cell, `None` out of range.
    #[must_use]
    pub fn class_at(&self, row: usize, col: usize) -> Option<ChangeClass> {
        self.classes.get((row, col)).copied()
    }

    /// Number of valid cells.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.delta.valid_count()
    }
}

/// Difference and classify two aligned index rasters.
///
/// # Errors
///
/// Returns [`PipelineError::GridMismatch`] if the rasters do not share a
/// grid (run [`align`](crate::align::align) first).
pub fn classify(
    before: &IndexRaster,
    after: &IndexRaster,
    thresholds: &Thresholds,
) -> Result<ChangeMap, PipelineError> {
    if let Some(reason) = before.spec.mismatch(&after.spec) {
        return Err(PipelineError::GridMismatch { reason });
    }

    let shape = before.spec.shape();
    let mut delta = Array2::zeros(shape);
    let mut valid = Array2::from_elem(shape, false);
    let mut classes = Array2::from_elem(shape, ChangeClass::Invalid);

    Zip::indexed(&mut delta)
        .and(&mut valid)
        .and(&mut classes)
        .for_each(|(row, col), d, ok, class| {
            if let (Some(b), Some(a)) = (before.grid.get(row, col), after.grid.get(row, col)) {
                let diff = a - b;
                if diff.is_finite() {
                    *d = diff;
                    *ok = true;
                    *class = thresholds.classify(diff);
                }
            }
        });

    Ok(ChangeMap {
        spec: before.spec,
        delta: MaskedGrid::new(delta, valid)?,
        classes,
        before_date: before.acquired,
        after_date: after.acquired,
        before_scenes: before.scenes.clone(),
        after_scenes: after.scenes.clone(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use crate::index::normalized_difference;
    use crate::testing::{date, index_raster};

    #[test]
    fn default_band_edges_are_closed_as_documented() {
        let t = Thresholds::default();
        assert_eq!(t.classify(-0.5), ChangeClass::SignificantLoss);
        assert_eq!(t.classify(-0.2), ChangeClass::SignificantLoss);
        assert_eq!(t.classify(-0.19), ChangeClass::ModerateLoss);
        assert_eq!(t.classify(-0.05), ChangeClass::ModerateLoss);
        assert_eq!(t.classify(-0.049), ChangeClass::Stable);
        assert_eq!(t.classify(0.0), ChangeClass::Stable);
        assert_eq!(t.classify(0.049), ChangeClass::Stable);
        assert_eq!(t.classify(0.05), ChangeClass::ModerateGain);
        assert_eq!(t.classify(0.199), ChangeClass::ModerateGain);
        assert_eq!(t.classify(0.2), ChangeClass::SignificantGain);
        assert_eq!(t.classify(2.0), ChangeClass::SignificantGain);
    }

    #[test]
    fn index_differences_on_an_edge_take_the_closed_side() {
        // 0.5 - 0.7 and 0.2 - 0.25 are not exact in binary floating point.
        let before = index_raster("b", date(2018, 7, 1), array![[0.7, 0.25, 0.2, 0.5]]);
        let after = index_raster("a", date(2023, 7, 1), array![[0.5, 0.2, 0.25, 0.7]]);
        let map = classify(&before, &after, &Thresholds::default()).unwrap();
        assert_eq!(map.class_at(0, 0), Some(ChangeClass::SignificantLoss));
        assert_eq!(map.class_at(0, 1), Some(ChangeClass::ModerateLoss));
        assert_eq!(map.class_at(0, 2), Some(ChangeClass::ModerateGain));
        assert_eq!(map.class_at(0, 3), Some(ChangeClass::SignificantGain));
    }

    #[test]
    fn partition_is_total_over_a_sweep() {
        let t = Thresholds::default();
        for i in -2000..=2000 {
            let delta = f64::from(i) / 1000.0;
            assert!(t.classify(delta).is_valid(), "{delta}");
        }
    }

    #[test]
    fn three_band_mode() {
        let t = Thresholds::three_band(-0.1, 0.1).unwrap();
        assert_eq!(t.band_count(), 3);
        assert_eq!(t.classify(-0.1), ChangeClass::SignificantLoss);
        assert_eq!(t.classify(0.0), ChangeClass::Stable);
        assert_eq!(t.classify(0.1), ChangeClass::SignificantGain);
    }

    #[test]
    fn rejects_bad_edges() {
        assert!(Thresholds::try_new(vec![0.1]).is_err());
        assert!(Thresholds::try_new(vec![-0.1, 0.0, 0.1]).is_err());
        assert!(Thresholds::five_band(-0.2, -0.05, -0.05, 0.2).is_err());
        assert!(Thresholds::three_band(0.1, -0.1).is_err());
        assert!(Thresholds::three_band(f64::NAN, 0.1).is_err());
    }

    #[test]
    fn thresholds_serde() {
        let json = serde_json::to_string(&Thresholds::default()).unwrap();
        assert_eq!(json, r#"{"edges":[-0.2,-0.05,0.05,0.2]}"#);
        let three: Thresholds = serde_json::from_str(r#"{"edges":[-0.3,0.3]}"#).unwrap();
        assert_eq!(three.band_count(), 3);
        assert!(serde_json::from_str::<Thresholds>(r#"{"edges":[0.3,-0.3]}"#).is_err());
    }

    #[test]
    fn vegetation_loss_scenario() {
        let before_ndvi = normalized_difference(0.5, 0.1).unwrap();
        let after_ndvi = normalized_difference(0.3, 0.3).unwrap();
        let before = index_raster("b", date(2018, 7, 20), array![[before_ndvi]]);
        let after = index_raster("a", date(2023, 7, 15), array![[after_ndvi]]);
        let map = classify(&before, &after, &Thresholds::default()).unwrap();
        assert_relative_eq!(map.delta.get(0, 0).unwrap(), -0.4 / 0.6);
        assert_eq!(map.class_at(0, 0), Some(ChangeClass::SignificantLoss));
        assert_eq!(map.before_date, date(2018, 7, 20));
        assert_eq!(map.after_date, date(2023, 7, 15));
    }

    #[test]
    fn invalid_in_either_input_is_invalid() {
        let mut before = index_raster("b", date(2018, 7, 1), array![[0.5, 0.5], [0.5, 0.5]]);
        before.grid = MaskedGrid::new(
            array![[0.5, 0.5], [0.5, 0.5]],
            array![[true, false], [true, true]],
        )
        .unwrap();
        let mut after = index_raster("a", date(2023, 7, 1), array![[0.5, 0.5], [0.1, 0.9]]);
        after.grid = MaskedGrid::new(
            array![[0.5, 0.5], [0.1, 0.9]],
            array![[true, true], [false, true]],
        )
        .unwrap();
        let map = classify(&before, &after, &Thresholds::default()).unwrap();
        assert_eq!(map.class_at(0, 0), Some(ChangeClass::Stable));
        assert_eq!(map.class_at(0, 1), Some(ChangeClass::Invalid));
        assert_eq!(map.class_at(1, 0), Some(ChangeClass::Invalid));
        assert_eq!(map.class_at(1, 1), Some(ChangeClass::SignificantGain));
        assert_eq!(map.valid_count(), 2);
        assert_eq!(map.delta.get(0, 1), None);
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let before = index_raster("b", date(2018, 7, 1), array![[0.5, 0.5]]);
        let after = index_raster("a", date(2023, 7, 1), array![[0.5], [0.5]]);
        assert!(matches!(
            classify(&before, &after, &Thresholds::default()),
            Err(PipelineError::GridMismatch { .. })
        ));
    }
}
