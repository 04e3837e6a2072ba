//! verdure-io: Filesystem-backed collaborators for the verdure pipeline.
//!
//! Provides a [`Catalog`](verdure_pipeline::Catalog) answered from a STAC
//! Item Collection file, an [`AssetDecoder`](verdure_pipeline::AssetDecoder)
//! for JSON raster documents, and an area-of-interest reader. All pixel
//! processing stays in `verdure-pipeline`.

pub mod aoi;
pub mod catalog;
pub mod decoder;
pub mod error;
pub mod stac;

use std::path::Path;

use serde::de::DeserializeOwned;

pub use aoi::{parse_aoi, read_aoi};
pub use catalog::FileCatalog;
pub use decoder::{JsonRasterDecoder, RasterDocument};
pub use error::{IoError, Result};

/// Read and deserialize a JSON file.
///
/// # Errors
///
/// [`IoError::Read`] or [`IoError::Json`], naming `path`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| IoError::Json {
        path: path.to_path_buf(),
        source,
    })
}
