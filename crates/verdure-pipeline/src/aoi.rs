//! Area-of-interest polygon.
//!
//! The polygon is validated once at construction; every other stage may
//! assume a closed, simple ring with geographic coordinates in range.

use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{
    Area, BooleanOps, BoundingRect, Contains, Coord, Intersects, Line, LineString, Point, Polygon,
};
use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::raster::Extent;
use crate::types::PipelineError;

/// Sub-segments per edge when projecting into a non-geographic CRS, so
/// straight lon/lat edges keep their shape after projection.
const PROJECTION_DENSIFY: usize = 16;

/// A closed polygon of `(longitude, latitude)` vertices in WGS84.
///
/// Invariants: at least four vertices, first equals last, coordinates
/// within `[-180, 180] x [-90, 90]`, no repeated consecutive vertex,
/// non-zero area, and no self-intersection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct AreaOfInterest {
    polygon: Polygon<f64>,
}

impl AreaOfInterest {
    /// Validate a ring of `(lon, lat)` vertices.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidAoi`] describing the first violated
    /// invariant.
    pub fn new(vertices: &[(f64, f64)]) -> Result<Self, PipelineError> {
        if vertices.len() < 4 {
            return Err(invalid(format!(
                "a closed polygon needs at least 4 vertices, got {}",
                vertices.len()
            )));
        }

        for (i, &(lon, lat)) in vertices.iter().enumerate() {
            if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
                return Err(invalid(format!("vertex {i}: longitude {lon} out of range")));
            }
            if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
                return Err(invalid(format!("vertex {i}: latitude {lat} out of range")));
            }
        }

        if vertices.first() != vertices.last() {
            return Err(invalid("first and last vertex differ".to_string()));
        }

        if let Some(i) = vertices.windows(2).position(|w| w[0] == w[1]) {
            return Err(invalid(format!("vertex {} repeats vertex {i}", i + 1)));
        }

        let coords: Vec<Coord<f64>> = vertices.iter().map(|&(x, y)| Coord { x, y }).collect();
        check_simple(&coords)?;

        let polygon = Polygon::new(LineString::new(coords), Vec::new());
        if polygon.unsigned_area() <= 0.0 {
            return Err(invalid("polygon has zero area".to_string()));
        }

        Ok(Self { polygon })
    }

    /// Axis-aligned rectangle, counter-clockwise from the south-west corner.
    ///
    /// # Errors
    ///
    /// See [`AreaOfInterest::new`].
    pub fn from_bbox(
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    ) -> Result<Self, PipelineError> {
        Self::new(&[
            (min_lon, min_lat),
            (max_lon, min_lat),
            (max_lon, max_lat),
            (min_lon, max_lat),
            (min_lon, min_lat),
        ])
    }

    /// The polygon in lon/lat.
    #[must_use]
    pub const fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    /// Vertices of the closed ring, first repeated last.
    pub fn vertices(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.polygon.exterior().coords().map(|c| (c.x, c.y))
    }

    /// Lon/lat bounding box.
    #[must_use]
    pub fn bounding_box(&self) -> Extent {
        self.polygon.bounding_rect().map_or(
            Extent::new(0.0, 0.0, 0.0, 0.0),
            |r| Extent::new(r.min().x, r.min().y, r.max().x, r.max().y),
        )
    }

    /// Whether a lon/lat point lies strictly inside the polygon.
    #[must_use]
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.polygon.contains(&Point::new(lon, lat))
    }

    /// Fraction of this area, in `[0, 1]`, that a lon/lat footprint covers.
    #[must_use]
    pub fn coverage_by(&self, footprint: &Polygon<f64>) -> f64 {
        if footprint.contains(&self.polygon) {
            return 1.0;
        }
        if !footprint.intersects(&self.polygon) {
            return 0.0;
        }
        let total = self.polygon.unsigned_area();
        if total <= 0.0 {
            return 0.0;
        }
        let shared = self.polygon.intersection(footprint).unsigned_area();
        (shared / total).clamp(0.0, 1.0)
    }

    /// The polygon with every vertex transformed into `crs`.
    ///
    /// Edges are densified first unless the target is geographic.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `crs` cannot be
    /// reprojected into.
    pub fn project(&self, crs: Crs) -> Result<Polygon<f64>, PipelineError> {
        if crs == Crs::Wgs84 {
            return Ok(self.polygon.clone());
        }

        let ring: Vec<Coord<f64>> = self.polygon.exterior().coords().copied().collect();
        let mut projected = Vec::with_capacity(ring.len() * PROJECTION_DENSIFY);
        for pair in ring.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            for step in 0..PROJECTION_DENSIFY {
                #[allow(clippy::cast_precision_loss)]
                let t = step as f64 / PROJECTION_DENSIFY as f64;
                let lon = t.mul_add(b.x - a.x, a.x);
                let lat = t.mul_add(b.y - a.y, a.y);
                let (x, y) = crs.from_wgs84(lon, lat)?;
                projected.push(Coord { x, y });
            }
        }
        if let Some(&first) = projected.first() {
            projected.push(first);
        }

        Ok(Polygon::new(LineString::new(projected), Vec::new()))
    }

    /// Area in squared units of `crs`. Use [`Crs::EqualArea`] for m².
    ///
    /// # Errors
    ///
    /// See [`AreaOfInterest::project`].
    pub fn area(&self, crs: Crs) -> Result<f64, PipelineError> {
        Ok(self.project(crs)?.unsigned_area())
    }
}

impl TryFrom<Vec<[f64; 2]>> for AreaOfInterest {
    type Error = PipelineError;

    fn try_from(vertices: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        let pairs: Vec<(f64, f64)> = vertices.into_iter().map(|[x, y]| (x, y)).collect();
        Self::new(&pairs)
    }
}

impl From<AreaOfInterest> for Vec<[f64; 2]> {
    fn from(aoi: AreaOfInterest) -> Self {
        aoi.vertices().map(|(x, y)| [x, y]).collect()
    }
}

const fn invalid(reason: String) -> PipelineError {
    PipelineError::InvalidAoi(reason)
}

/// Reject rings whose edges cross or overlap.
///
/// Adjacent edges share exactly their common vertex. Any other contact,
/// or a collinear overlap between adjacent edges, is a self-intersection.
fn check_simple(ring: &[Coord<f64>]) -> Result<(), PipelineError> {
    let edges: Vec<Line<f64>> = ring.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = edges.len();

    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(edges[i], edges[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => {
                    return Err(invalid(format!("edges {i} and {j} intersect")));
                }
            }
        }
    }
    Ok(())
}
