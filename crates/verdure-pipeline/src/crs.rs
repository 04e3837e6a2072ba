//! Coordinate reference systems and point transforms.
//!
//! Supports the systems satellite imagery is actually delivered in or
//! analysed in: WGS84 geographic (EPSG:4326), UTM north/south
//! (EPSG:326xx / 327xx, Sentinel-2 and Landsat tiles), and the global
//! equal-area EASE-Grid 2.0 (EPSG:6933) for area statistics. All
//! transforms pivot through WGS84 and use closed-form ellipsoidal
//! formulas (Snyder 1987), so no native projection library is needed.
//!
//! Any other EPSG code is carried as [`Crs::Other`] metadata. Rasters in
//! such a system can be compared with each other but not reprojected.

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::raster::Extent;
use crate::types::PipelineError;

// WGS84 ellipsoid.
const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const E2: f64 = 2.0 * F - F * F;
const E_PRIME2: f64 = E2 / (1.0 - E2);

// UTM.
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

// EASE-Grid 2.0 standard parallel.
const EASE_STANDARD_PARALLEL: f64 = 30.0;

/// Points sampled along each edge when transforming an extent.
const EXTENT_EDGE_SAMPLES: usize = 21;

/// A coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Crs {
    /// WGS84 longitude/latitude in degrees (EPSG:4326).
    Wgs84,
    /// Universal Transverse Mercator on WGS84, metres.
    Utm {
        /// Zone number, 1 to 60.
        zone: u8,
        /// Northern hemisphere (326xx) or southern (327xx).
        north: bool,
    },
    /// EASE-Grid 2.0 global cylindrical equal-area, metres (EPSG:6933).
    EqualArea,
    /// Any other system. Carried through but never reprojected.
    Other(u32),
}

impl Crs {
    /// Interpret an EPSG code.
    #[must_use]
    pub fn from_epsg(epsg: u32) -> Self {
        match epsg {
            4326 => Self::Wgs84,
            6933 => Self::EqualArea,
            32601..=32660 => Self::Utm {
                zone: u8::try_from(epsg - 32600).unwrap_or(0),
                north: true,
            },
            32701..=32760 => Self::Utm {
                zone: u8::try_from(epsg - 32700).unwrap_or(0),
                north: false,
            },
            other => Self::Other(other),
        }
    }

    /// The EPSG code of this system.
    #[must_use]
    pub fn epsg(self) -> u32 {
        match self {
            Self::Wgs84 => 4326,
            Self::EqualArea => 6933,
            Self::Utm { zone, north: true } => 32600 + u32::from(zone),
            Self::Utm { zone, north: false } => 32700 + u32::from(zone),
            Self::Other(code) => code,
        }
    }

    /// Whether coordinates are planar metres (as opposed to degrees).
    ///
    /// Unknown systems are assumed projected; almost every imagery CRS is.
    #[must_use]
    pub const fn is_projected(self) -> bool {
        !matches!(self, Self::Wgs84)
    }

    /// The UTM zone containing a longitude/latitude.
    #[must_use]
    pub fn utm_for(lon: f64, lat: f64) -> Self {
        let zone = ((lon + 180.0) / 6.0).floor().clamp(0.0, 59.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let zone = zone as u8 + 1;
        Self::Utm {
            zone,
            north: lat >= 0.0,
        }
    }

    /// Convert a coordinate in this system to WGS84 longitude/latitude.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for [`Crs::Other`].
    pub fn to_wgs84(self, x: f64, y: f64) -> Result<(f64, f64), PipelineError> {
        match self {
            Self::Wgs84 => Ok((x, y)),
            Self::Utm { zone, north } => Ok(utm_to_wgs84(x, y, zone, north)),
            Self::EqualArea => Ok(ease_to_wgs84(x, y)),
            Self::Other(code) => Err(unsupported(code)),
        }
    }

    /// Convert a WGS84 longitude/latitude into this system.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for [`Crs::Other`].
    pub fn from_wgs84(self, lon: f64, lat: f64) -> Result<(f64, f64), PipelineError> {
        match self {
            Self::Wgs84 => Ok((lon, lat)),
            Self::Utm { zone, north } => Ok(wgs84_to_utm(lon, lat, zone, north)),
            Self::EqualArea => Ok(wgs84_to_ease(lon, lat)),
            Self::Other(code) => Err(unsupported(code)),
        }
    }

    /// Convert a coordinate from this system into `target`.
    ///
    /// Identity when both systems are the same, including two identical
    /// [`Crs::Other`] codes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when either side is an
    /// unsupported system and the two differ.
    pub fn transform(self, target: Self, x: f64, y: f64) -> Result<(f64, f64), PipelineError> {
        if self == target {
            return Ok((x, y));
        }
        let (lon, lat) = self.to_wgs84(x, y)?;
        target.from_wgs84(lon, lat)
    }

    /// Transform an extent into `target`, returning the envelope of the
    /// transformed boundary.
    ///
    /// Each edge is densified before transforming so the curvature of the
    /// projection is captured, not only the four corners.
    ///
    /// # Errors
    ///
    /// See [`Crs::transform`].
    pub fn transform_extent(self, target: Self, extent: &Extent) -> Result<Extent, PipelineError> {
        if self == target {
            return Ok(*extent);
        }

        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;

        #[allow(clippy::cast_precision_loss)]
        let steps = (EXTENT_EDGE_SAMPLES - 1) as f64;
        for i in 0..EXTENT_EDGE_SAMPLES {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64 / steps;
            let x = t.mul_add(extent.max_x - extent.min_x, extent.min_x);
            let y = t.mul_add(extent.max_y - extent.min_y, extent.min_y);
            for (px, py) in [
                (x, extent.min_y),
                (x, extent.max_y),
                (extent.min_x, y),
                (extent.max_x, y),
            ] {
                let (tx, ty) = self.transform(target, px, py)?;
                min_x = min_x.min(tx);
                min_y = min_y.min(ty);
                max_x = max_x.max(tx);
                max_y = max_y.max(ty);
            }
        }

        Ok(Extent::new(min_x, min_y, max_x, max_y))
    }
}

impl From<u32> for Crs {
    fn from(epsg: u32) -> Self {
        Self::from_epsg(epsg)
    }
}

impl From<Crs> for u32 {
    fn from(crs: Crs) -> Self {
        crs.epsg()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

fn unsupported(code: u32) -> PipelineError {
    PipelineError::InvalidConfig(format!("reprojection to or from EPSG:{code} is not supported"))
}

// ── UTM (Snyder 1987, USGS Prof. Paper 1395, pp. 61-64) ──────────────────

fn central_meridian(zone: u8) -> f64 {
    (f64::from(zone) - 1.0).mul_add(6.0, -180.0 + 3.0).to_radians()
}

/// Meridional arc length from the equator (Snyder eq. 3-21).
fn meridional_arc(lat: f64) -> f64 {
    let e4 = E2 * E2;
    let e6 = e4 * E2;
    A * ((1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
        - (3.0 * E2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}

fn wgs84_to_utm(lon_deg: f64, lat_deg: f64, zone: u8, north: bool) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let lon0 = central_meridian(zone);

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = A / (1.0 - E2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = E_PRIME2 * cos_lat * cos_lat;
    let a = cos_lat * (lon - lon0);
    let m = meridional_arc(lat);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a2 * a2;
    let a5 = a4 * a;
    let a6 = a4 * a2;

    let easting = K0
        * n
        * (a + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * E_PRIME2) * a5 / 120.0)
        + FALSE_EASTING;

    let mut northing = K0
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * E_PRIME2) * a6 / 720.0));
    if !north {
        northing += FALSE_NORTHING_SOUTH;
    }

    (easting, northing)
}

fn utm_to_wgs84(easting: f64, northing: f64, zone: u8, north: bool) -> (f64, f64) {
    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let y = if north {
        northing
    } else {
        northing - FALSE_NORTHING_SOUTH
    };

    let m = y / K0;
    let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let sqrt_1_e2 = (1.0 - E2).sqrt();
    let e1 = (1.0 - sqrt_1_e2) / (1.0 + sqrt_1_e2);
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_2 * e1_2;

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let c1 = E_PRIME2 * cos_phi1 * cos_phi1;
    let t1 = tan_phi1 * tan_phi1;
    let denom = 1.0 - E2 * sin_phi1 * sin_phi1;
    let n1 = A / denom.sqrt();
    let r1 = A * (1.0 - E2) / denom.powf(1.5);
    let d = (easting - FALSE_EASTING) / (n1 * K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d2 * d2;
    let d5 = d4 * d;
    let d6 = d4 * d2;

    let lat = phi1
        - (n1 * tan_phi1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * E_PRIME2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                    - 252.0 * E_PRIME2
                    - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let lon = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * E_PRIME2 + 24.0 * t1 * t1) * d5
                / 120.0)
            / cos_phi1;

    (lon.to_degrees(), lat.to_degrees())
}

// ── EASE-Grid 2.0 (ellipsoidal Lambert cylindrical equal-area) ───────────

/// Scale factor along the standard parallel.
fn ease_k0() -> f64 {
    let phi_s = EASE_STANDARD_PARALLEL.to_radians();
    let sin_s = phi_s.sin();
    phi_s.cos() / (1.0 - E2 * sin_s * sin_s).sqrt()
}

/// Authalic `q` function (Snyder eq. 3-12).
fn authalic_q(lat: f64) -> f64 {
    let e = E2.sqrt();
    let sin_lat = lat.sin();
    (1.0 - E2)
        * (sin_lat / (1.0 - E2 * sin_lat * sin_lat)
            - (1.0 / (2.0 * e)) * ((1.0 - e * sin_lat) / (1.0 + e * sin_lat)).ln())
}

fn wgs84_to_ease(lon_deg: f64, lat_deg: f64) -> (f64, f64) {
    let k0 = ease_k0();
    let x = A * k0 * lon_deg.to_radians();
    let y = A * authalic_q(lat_deg.to_radians()) / (2.0 * k0);
    (x, y)
}

fn ease_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let k0 = ease_k0();
    let qp = authalic_q(PI / 2.0);
    let beta = (2.0 * y * k0 / (A * qp)).clamp(-1.0, 1.0).asin();

    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let lat = beta
        + (E2 / 3.0 + 31.0 * e4 / 180.0 + 517.0 * e6 / 5040.0) * (2.0 * beta).sin()
        + (23.0 * e4 / 360.0 + 251.0 * e6 / 3780.0) * (4.0 * beta).sin()
        + (761.0 * e6 / 45360.0) * (6.0 * beta).sin();
    let lon = x / (A * k0);

    (lon.to_degrees(), lat.to_degrees())
}
