//! Decoder for JSON raster documents on the local filesystem.
//!
//! A raster document is a single JSON object:
//!
//! ```json
//! {
//!   "crs": 4326,
//!   "transform": [-104.0, 0.01, 0.0, 44.0, 0.0, -0.01],
//!   "rows": 2, "cols": 2,
//!   "nodata": -9999,
//!   "values": [0.41, 0.38, -9999, 0.40],
//!   "quality": [4, 4, 0, 9]
//! }
//! ```
//!
//! `transform` uses GDAL coefficient order, `values` is row-major, and
//! `quality` (optional) holds Sentinel-2 scene classification codes. A
//! quality-mask asset is the same document with the codes in `values`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use verdure_pipeline::{
    AssetDecoder, AssetRef, Band, Crs, DecodeError, DecodedBand, DecodedMask, GeoTransform,
    GridSpec, PixelQuality,
};

/// On-disk raster layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterDocument {
    /// EPSG code.
    pub crs: u32,
    /// GDAL geotransform coefficients.
    pub transform: [f64; 6],
    /// Grid height.
    pub rows: usize,
    /// Grid width.
    pub cols: usize,
    /// Sentinel for missing samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
    /// Row-major samples.
    pub values: Vec<f64>,
    /// Row-major scene classification codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Vec<u8>>,
}

impl RasterDocument {
    fn spec(&self) -> Result<GridSpec, DecodeError> {
        let transform = GeoTransform::from_gdal(self.transform).ok_or_else(|| {
            DecodeError::Unsupported(format!(
                "rotated or degenerate transform {:?}",
                self.transform
            ))
        })?;
        if self.rows == 0 || self.cols == 0 {
            return Err(DecodeError::Corrupt(format!(
                "empty raster {}x{}",
                self.rows, self.cols
            )));
        }
        Ok(GridSpec::new(
            Crs::from_epsg(self.crs),
            transform,
            self.rows,
            self.cols,
        ))
    }

    /// Interpret as a spectral band.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Unsupported`] for a rotated transform,
    /// [`DecodeError::Corrupt`] when the arrays do not match the shape.
    pub fn into_band(self) -> Result<DecodedBand, DecodeError> {
        let spec = self.spec()?;
        let shape = (self.rows, self.cols);
        let quality = self
            .quality
            .map(|codes| shaped(shape, "quality codes", codes))
            .transpose()?
            .map(|codes| codes.mapv(PixelQuality::from_scl));
        let values = shaped(shape, "values", self.values)?;
        Ok(DecodedBand {
            spec,
            values,
            nodata: self.nodata,
            quality,
        })
    }

    /// Interpret `values` as scene classification codes.
    ///
    /// # Errors
    ///
    /// As [`into_band`](Self::into_band); also [`DecodeError::Corrupt`]
    /// for a value that is not a code in `0..=255`.
    pub fn into_mask(self) -> Result<DecodedMask, DecodeError> {
        let spec = self.spec()?;
        let codes = self
            .values
            .iter()
            .map(|&v| {
                if v.fract() == 0.0 && (0.0..=255.0).contains(&v) {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let code = v as u8;
                    Ok(PixelQuality::from_scl(code))
                } else {
                    Err(DecodeError::Corrupt(format!("{v} is not a classification code")))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DecodedMask {
            spec,
            classes: shaped((self.rows, self.cols), "classification codes", codes)?,
        })
    }
}

fn shaped<T>(shape: (usize, usize), name: &str, cells: Vec<T>) -> Result<Array2<T>, DecodeError> {
    Array2::from_shape_vec(shape, cells).map_err(|e| {
        DecodeError::Corrupt(format!(
            "{name} do not fill a {}x{} grid: {e}",
            shape.0, shape.1
        ))
    })
}

/// [`AssetDecoder`] reading [`RasterDocument`]s below a root directory.
///
/// Relative hrefs resolve against the root; absolute paths are used as
/// is. Remote (`scheme://`) hrefs are rejected as unsupported.
#[derive(Debug, Clone)]
pub struct JsonRasterDecoder {
    root: PathBuf,
}

impl JsonRasterDecoder {
    /// Decoder resolving hrefs against `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, href: &str) -> Result<PathBuf, DecodeError> {
        if let Some((scheme, _)) = href.split_once("://")
            && scheme != "file"
        {
            return Err(DecodeError::Unsupported(format!(
                "remote asset {href} (only local files are supported)"
            )));
        }
        let path = Path::new(href.strip_prefix("file://").unwrap_or(href));
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    fn read(&self, asset: &AssetRef) -> Result<RasterDocument, DecodeError> {
        let path = self.resolve(&asset.href)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            let message = format!("{}: {e}", path.display());
            match e.kind() {
                ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                    DecodeError::Transient(message)
                }
                _ => DecodeError::Corrupt(message),
            }
        })?;
        serde_json::from_str(&text)
            .map_err(|e| DecodeError::Corrupt(format!("{}: {e}", path.display())))
    }
}

impl AssetDecoder for JsonRasterDecoder {
    fn decode_band(
        &self,
        asset: &AssetRef,
        band: Band,
        _timeout: Duration,
    ) -> Result<DecodedBand, DecodeError> {
        tracing::debug!(href = %asset.href, %band, "decoding band");
        self.read(asset)?.into_band()
    }

    fn decode_mask(&self, asset: &AssetRef, _timeout: Duration) -> Result<DecodedMask, DecodeError> {
        tracing::debug!(href = %asset.href, "decoding quality mask");
        self.read(asset)?.into_mask()
    }
}
