//! Read-only units of work: quota lookups and the eviction candidate scan.

use std::collections::HashSet;

use redb::{ReadTransaction, ReadableTable};

use super::schema::{
    self, PAGES, PAGE_STATS, PAGE_STATS_BY_LFU, PAGE_STATS_BY_LRU, QUOTAS, QUOTA_BY_TILESET,
    TILESETS, TILESETS_BY_LAYER,
};
use super::worker::StoreResources;
use crate::error::StoreError;
use crate::page::{PageStats, TilePage};
use crate::quota::Quota;
use crate::tileset::TileSet;

/// Which ordered statistics index an eviction scan walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpirationPolicy {
    LeastRecentlyUsed,
    LeastFrequentlyUsed,
}

fn read_quota_by_tile_set(
    txn: &ReadTransaction,
    tile_set_id: &str,
) -> Result<Option<Quota>, StoreError> {
    let by_tileset = txn.open_table(QUOTA_BY_TILESET)?;
    let Some(quota_id) = by_tileset.get(tile_set_id)?.map(|value| value.value()) else {
        return Ok(None);
    };
    let quotas = txn.open_table(QUOTAS)?;
    match quotas.get(quota_id)? {
        Some(raw) => Ok(Some(schema::decode(raw.value())?)),
        None => Ok(None),
    }
}

/// The quota row of one tile set.
pub(crate) fn used_quota_by_tile_set_id(
    resources: &StoreResources,
    tile_set_id: &str,
) -> Result<Quota, StoreError> {
    let txn = resources.db.begin_read()?;
    read_quota_by_tile_set(&txn, tile_set_id)?
        .ok_or_else(|| StoreError::NoSuchTileSet(tile_set_id.to_string()))
}

/// Bytes used by a layer, summed over its tile sets.
pub(crate) fn used_quota_by_layer(
    resources: &StoreResources,
    layer_name: &str,
) -> Result<Quota, StoreError> {
    let txn = resources.db.begin_read()?;
    let by_layer = txn.open_table(TILESETS_BY_LAYER)?;
    let tile_set_ids = schema::layer_tile_set_ids(&by_layer, layer_name)?;
    if tile_set_ids.is_empty() {
        return Err(StoreError::NoSuchLayer(layer_name.to_string()));
    }

    let mut aggregated = Quota::new();
    for tile_set_id in tile_set_ids {
        let quota = read_quota_by_tile_set(&txn, &tile_set_id)?
            .ok_or_else(|| StoreError::NoSuchTileSet(tile_set_id.clone()))?;
        aggregated.add(&quota);
    }
    Ok(aggregated)
}

/// One tile set by id.
pub(crate) fn tile_set_by_id(
    resources: &StoreResources,
    tile_set_id: &str,
) -> Result<TileSet, StoreError> {
    let txn = resources.db.begin_read()?;
    let tilesets = txn.open_table(TILESETS)?;
    match tilesets.get(tile_set_id)? {
        Some(raw) => Ok(schema::decode(raw.value())?),
        None => Err(StoreError::NoSuchTileSet(tile_set_id.to_string())),
    }
}

/// Walk the chosen eviction index ascending and return the first page that
/// still holds tiles and belongs to one of the given layers.
pub(crate) fn find_page_to_expire(
    resources: &StoreResources,
    policy: ExpirationPolicy,
    layer_names: &[String],
) -> Result<Option<TilePage>, StoreError> {
    let txn = resources.db.begin_read()?;

    let by_layer = txn.open_table(TILESETS_BY_LAYER)?;
    let mut tile_set_ids: HashSet<String> = HashSet::new();
    for layer_name in layer_names {
        tile_set_ids.extend(schema::layer_tile_set_ids(&by_layer, layer_name)?);
    }

    let index = match policy {
        ExpirationPolicy::LeastRecentlyUsed => txn.open_table(PAGE_STATS_BY_LRU)?,
        ExpirationPolicy::LeastFrequentlyUsed => txn.open_table(PAGE_STATS_BY_LFU)?,
    };
    let stats_table = txn.open_table(PAGE_STATS)?;
    let pages = txn.open_table(PAGES)?;

    for entry in index.iter()? {
        let (key, _) = entry?;
        let (_, stats_id) = key.value();

        let stats: PageStats = match stats_table.get(stats_id)? {
            Some(raw) => schema::decode(raw.value())?,
            None => {
                return Err(StoreError::Invariant(format!(
                    "eviction index references missing stats row {stats_id}"
                )))
            }
        };

        if stats.fill_factor() > 0.0 {
            let page: TilePage = match pages.get(stats.page_id())? {
                Some(raw) => schema::decode(raw.value())?,
                None => {
                    return Err(StoreError::Invariant(format!(
                        "stats row {stats_id} references missing page {}",
                        stats.page_id()
                    )))
                }
            };
            if tile_set_ids.contains(page.tile_set_id()) {
                return Ok(Some(page));
            }
        }
    }

    Ok(None)
}
