//! A catalog answered from a STAC Item Collection on disk.

use std::path::Path;

use geo::BoundingRect;
use verdure_pipeline::{Catalog, CatalogError, CatalogQuery, SceneCandidate};

use crate::error::{IoError, Result};
use crate::read_json;
use crate::stac::ItemCollection;

/// In-memory scene list loaded from a STAC `FeatureCollection`.
///
/// Searches filter by collection, acquisition window, bounding-box
/// intersection and cloud ceiling, and return matches ordered by
/// acquisition date then id, like a paged STAC API would.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    scenes: Vec<SceneCandidate>,
}

impl FileCatalog {
    /// Read an Item Collection JSON file.
    ///
    /// Items without a `collection` field are assigned
    /// `default_collection`.
    ///
    /// # Errors
    ///
    /// [`IoError::Read`] or [`IoError::Json`] for an unreadable file,
    /// [`IoError::InvalidItem`] for an item that cannot become a scene.
    pub fn open(path: &Path, default_collection: &str) -> Result<Self> {
        let collection: ItemCollection = read_json(path)?;
        let catalog = Self::from_items(&collection, default_collection)?;
        tracing::debug!(
            path = %path.display(),
            scenes = catalog.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    /// Build from parsed items.
    ///
    /// # Errors
    ///
    /// [`IoError::InvalidItem`] for the first item that cannot become a scene.
    pub fn from_items(collection: &ItemCollection, default_collection: &str) -> Result<Self> {
        let scenes = collection
            .features
            .iter()
            .map(|item| item.to_candidate(default_collection))
            .collect::<std::result::Result<Vec<_>, IoError>>()?;
        Ok(Self { scenes })
    }

    /// Wrap already-built scenes.
    #[must_use]
    pub const fn from_scenes(scenes: Vec<SceneCandidate>) -> Self {
        Self { scenes }
    }

    /// Number of scenes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    /// Whether the catalog holds no scene.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

impl Catalog for FileCatalog {
    fn search(
        &self,
        query: &CatalogQuery,
    ) -> std::result::Result<Vec<SceneCandidate>, CatalogError> {
        let ceiling = query.max_cloud_cover.unwrap_or(1.0);
        let bbox = query.bbox;

        let mut hits: Vec<SceneCandidate> = self
            .scenes
            .iter()
            .filter(|s| s.collection() == query.collection)
            .filter(|s| query.window.contains(s.acquired()))
            .filter(|s| s.cloud_cover() <= ceiling)
            .filter(|s| {
                s.footprint().bounding_rect().is_some_and(|r| {
                    r.min().x <= bbox.max_x
                        && r.max().x >= bbox.min_x
                        && r.min().y <= bbox.max_y
                        && r.max().y >= bbox.min_y
                })
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.acquired().cmp(&b.acquired()).then_with(|| a.id().cmp(b.id())));

        tracing::debug!(
            collection = %query.collection,
            start = %query.window.start,
            end = %query.window.end,
            hits = hits.len(),
            "catalog search"
        );
        Ok(hits)
    }
}
