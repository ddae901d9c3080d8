//! Contracts consumed from the surrounding tile cache.
//!
//! The store does not know how layers are configured or how pages map onto
//! tile grids; it consumes that knowledge through these traits. Production
//! wiring implements them against the cache's layer configuration, tests
//! substitute fixtures.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use num_bigint::BigUint;

use crate::page::TilePage;
use crate::tileset::TileSet;

/// A rectangular tile range `[min_x, max_x] x [min_y, max_y]` in grid
/// coordinates, as covered by a tile page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRect {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x: u64,
    pub max_y: u64,
}

/// Locates the cache directory the store roots itself under.
pub trait CacheDirLocator: Send + Sync {
    /// Absolute path of the cache root.
    fn default_path(&self) -> io::Result<PathBuf>;
}

/// Locator backed by the platform cache directory.
#[derive(Debug, Default)]
pub struct DefaultCacheDirLocator;

impl CacheDirLocator for DefaultCacheDirLocator {
    fn default_path(&self) -> io::Result<PathBuf> {
        dirs::cache_dir()
            .map(|dir| dir.join("tilequota"))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "no platform cache directory available",
                )
            })
    }
}

/// Locator pinned to a fixed path, for embedders and tests.
#[derive(Debug, Clone)]
pub struct FixedCacheDirLocator {
    root: PathBuf,
}

impl FixedCacheDirLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CacheDirLocator for FixedCacheDirLocator {
    fn default_path(&self) -> io::Result<PathBuf> {
        Ok(self.root.clone())
    }
}

/// Oracle mapping layers to tile sets and pages to tile grids.
pub trait TilePageCalculator: Send + Sync {
    /// Names of all layers currently configured in the cache.
    fn layer_names(&self) -> HashSet<String>;

    /// The tile sets belonging to a layer.
    fn tile_sets_for(&self, layer_name: &str) -> HashSet<TileSet>;

    /// Total tile capacity of one page of the given tile set at the given
    /// zoom level.
    fn tiles_per_page(&self, tile_set: &TileSet, zoom_level: u8) -> BigUint;

    /// The grid ranges covered by a page, one rectangle per affected zoom
    /// level.
    fn to_grid_coverage(&self, tile_set: &TileSet, page: &TilePage) -> Vec<GridRect>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_locator_returns_configured_root() {
        let locator = FixedCacheDirLocator::new("/tmp/gwc-cache");
        assert_eq!(
            locator.default_path().unwrap(),
            PathBuf::from("/tmp/gwc-cache")
        );
    }

    #[test]
    fn grid_rect_equality() {
        let a = GridRect {
            min_x: 0,
            min_y: 0,
            max_x: 7,
            max_y: 7,
        };
        let b = a;
        assert_eq!(a, b);
    }
}
