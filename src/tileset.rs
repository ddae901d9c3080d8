//! Tile set identity.

use serde::{Deserialize, Serialize};

/// Id and layer name of the sentinel tile set backing the global quota row.
pub const GLOBAL_QUOTA_ID: &str = "___GLOBAL_QUOTA___";

/// A concrete (layer, gridset, format, parameters) tuple whose cached tiles
/// share storage accounting.
///
/// The id is a deterministic function of the tuple, so externally
/// constructed tile sets and stored ones agree on identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileSet {
    id: String,
    layer_name: String,
    gridset_id: String,
    blob_format: String,
    parameters_hash: Option<String>,
}

impl TileSet {
    /// Create a tile set for the given tuple.
    ///
    /// # Arguments
    ///
    /// * `layer_name` - Owning layer
    /// * `gridset_id` - Grid subset the tiles are cut against
    /// * `blob_format` - Tile image format (e.g. "image/png")
    /// * `parameters_hash` - Hash of extra request parameters, if any
    pub fn new(
        layer_name: impl Into<String>,
        gridset_id: impl Into<String>,
        blob_format: impl Into<String>,
        parameters_hash: Option<String>,
    ) -> Self {
        let layer_name = layer_name.into();
        let gridset_id = gridset_id.into();
        let blob_format = blob_format.into();

        let mut id = format!("{}#{}#{}", layer_name, gridset_id, blob_format);
        if let Some(hash) = &parameters_hash {
            id.push('#');
            id.push_str(hash);
        }

        Self {
            id,
            layer_name,
            gridset_id,
            blob_format,
            parameters_hash,
        }
    }

    /// The sentinel tile set that anchors the global quota row.
    pub(crate) fn global() -> Self {
        Self {
            id: GLOBAL_QUOTA_ID.to_string(),
            layer_name: GLOBAL_QUOTA_ID.to_string(),
            gridset_id: String::new(),
            blob_format: String::new(),
            parameters_hash: None,
        }
    }

    /// Unique tile set id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning layer name.
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// Grid subset id.
    pub fn gridset_id(&self) -> &str {
        &self.gridset_id
    }

    /// Tile format.
    pub fn blob_format(&self) -> &str {
        &self.blob_format
    }

    /// Hash of extra request parameters, if any.
    pub fn parameters_hash(&self) -> Option<&str> {
        self.parameters_hash.as_deref()
    }

    /// Whether this is the sentinel backing the global quota row.
    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_QUOTA_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_derives_from_tuple() {
        let tile_set = TileSet::new("roads", "EPSG:900913", "image/png", None);
        assert_eq!(tile_set.id(), "roads#EPSG:900913#image/png");
        assert_eq!(tile_set.layer_name(), "roads");
    }

    #[test]
    fn id_includes_parameters_hash() {
        let tile_set = TileSet::new(
            "roads",
            "EPSG:900913",
            "image/png",
            Some("7d1f8a".to_string()),
        );
        assert_eq!(tile_set.id(), "roads#EPSG:900913#image/png#7d1f8a");
    }

    #[test]
    fn equality_follows_identity() {
        let a = TileSet::new("roads", "EPSG:900913", "image/png", None);
        let b = TileSet::new("roads", "EPSG:900913", "image/png", None);
        let c = TileSet::new("roads", "EPSG:4326", "image/png", None);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn global_sentinel() {
        let sentinel = TileSet::global();
        assert!(sentinel.is_global());
        assert_eq!(sentinel.id(), GLOBAL_QUOTA_ID);
        assert_eq!(sentinel.layer_name(), GLOBAL_QUOTA_ID);

        let ordinary = TileSet::new("roads", "EPSG:900913", "image/png", None);
        assert!(!ordinary.is_global());
    }
}
