//! Mutating units of work.
//!
//! Every function here runs inside one write transaction on the writer
//! thread: commit on success, abort on failure. The global quota row must
//! always equal the sum of all per-tile-set rows, so both sides of every
//! diff are updated inside the same transaction.

use num_bigint::BigInt;
use tracing::{info, warn};

use super::schema::{self, WriteTables, SEQ_PAGE_STATS};
use super::worker::StoreResources;
use crate::calculator::TilePageCalculator;
use crate::error::StoreError;
use crate::page::{PageStats, PageStatsPayload, TilePage};
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Delete all accounting owned by a layer.
pub(crate) fn delete_layer(resources: &StoreResources, layer_name: &str) -> Result<(), StoreError> {
    let txn = resources.db.begin_write()?;
    let result = WriteTables::open(&txn)
        .and_then(|mut tables| delete_layer_in(&mut tables, layer_name));
    schema::finish(txn, result)
}

/// Cascade-delete a layer inside an already-open transaction.
///
/// For each tile set of the layer: the tile set row, its quota row, and all
/// of its pages and stats are removed, and the freed bytes are subtracted
/// from the global quota row.
pub(crate) fn delete_layer_in(
    tables: &mut WriteTables<'_>,
    layer_name: &str,
) -> Result<(), StoreError> {
    let tile_set_ids = schema::layer_tile_set_ids(&tables.tilesets_by_layer, layer_name)?;

    for tile_set_id in tile_set_ids {
        let freed = tables.get_quota_by_tile_set(&tile_set_id)?;
        let mut global = tables
            .get_quota_by_tile_set(GLOBAL_QUOTA_ID)?
            .ok_or(StoreError::NotInitialized)?;

        tables.remove_tile_set(&tile_set_id, layer_name)?;

        match freed {
            Some(freed) => {
                tables.remove_quota(&freed)?;
                global.subtract_bytes(freed.bytes());
            }
            None => {
                warn!(
                    tile_set = %tile_set_id,
                    "Tile set has no used quota row, treating freed space as zero"
                );
            }
        }

        let prefix = format!("{}@", tile_set_id);
        for (page_key, page_id) in schema::pages_with_key_prefix(&tables.page_by_key, &prefix)? {
            tables.remove_page_and_stats(&page_key, page_id)?;
        }

        tables.put_quota(&global)?;
    }

    Ok(())
}

/// Add a byte diff to a tile set's quota (and the global aggregate) and fold
/// tile-count diffs into the affected pages' fill factors.
///
/// If the tile set vanished since the caller looked it up, the whole unit
/// degrades to a logged no-op. Any per-page failure aborts the entire batch.
pub(crate) fn add_to_quota_and_tile_counts(
    resources: &StoreResources,
    tile_set: &TileSet,
    quota_diff: &BigInt,
    payloads: &[PageStatsPayload],
) -> Result<(), StoreError> {
    let txn = resources.db.begin_write()?;
    let applied = WriteTables::open(&txn).and_then(|mut tables| {
        add_to_quota_in(
            &mut tables,
            resources.calculator.as_ref(),
            tile_set,
            quota_diff,
            payloads,
        )
    });

    match applied {
        Ok(true) => {
            txn.commit()?;
            Ok(())
        }
        Ok(false) => {
            // Tile set concurrently deleted: drop the whole update.
            txn.abort()?;
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = txn.abort() {
                warn!(error = %abort_err, "Failed to abort quota store transaction");
            }
            Err(err)
        }
    }
}

fn add_to_quota_in(
    tables: &mut WriteTables<'_>,
    calculator: &dyn TilePageCalculator,
    tile_set: &TileSet,
    quota_diff: &BigInt,
    payloads: &[PageStatsPayload],
) -> Result<bool, StoreError> {
    if tables.get_tile_set(tile_set.id())?.is_none() {
        info!(
            tile_set = %tile_set.id(),
            "Cannot add to tile set used quota, tile set does not exist. Was it deleted?"
        );
        return Ok(false);
    }

    add_to_used_quota(tables, tile_set.id(), quota_diff)?;

    for payload in payloads {
        let (stored_page, mut stats, previous) = resolve_or_create_page(tables, payload.page())?;

        let tiles_per_page = calculator.tiles_per_page(tile_set, stored_page.zoom_level());
        stats.add_tiles(payload.num_tiles(), &tiles_per_page);
        tables.put_stats(previous.as_ref(), &stats)?;
    }

    Ok(true)
}

fn add_to_used_quota(
    tables: &mut WriteTables<'_>,
    tile_set_id: &str,
    quota_diff: &BigInt,
) -> Result<(), StoreError> {
    let mut used = tables.get_quota_by_tile_set(tile_set_id)?.ok_or_else(|| {
        StoreError::Invariant(format!("tile set '{tile_set_id}' has no used quota row"))
    })?;
    let mut global = tables
        .get_quota_by_tile_set(GLOBAL_QUOTA_ID)?
        .ok_or(StoreError::NotInitialized)?;

    used.add_bytes(quota_diff);
    global.add_bytes(quota_diff);

    tables.put_quota(&used)?;
    tables.put_quota(&global)?;
    Ok(())
}

/// Fold hit batches into page statistics and move access times forward.
///
/// Payloads whose tile set vanished are skipped individually; any other
/// failure aborts the batch. Returns the updated stats rows in payload
/// order.
pub(crate) fn add_hits_and_set_access_time(
    resources: &StoreResources,
    payloads: &[PageStatsPayload],
) -> Result<Vec<PageStats>, StoreError> {
    let txn = resources.db.begin_write()?;
    let result = WriteTables::open(&txn).and_then(|mut tables| {
        let mut all_stats = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let page = payload.page();
            if tables.get_tile_set(page.tile_set_id())?.is_none() {
                info!(
                    tile_set = %page.tile_set_id(),
                    "Cannot add usage stats, tile set does not exist. Was it deleted?"
                );
                continue;
            }

            let (stored_page, mut stats, previous) = resolve_or_create_page(&mut tables, page)?;

            let last_access_time_minutes = (payload.last_access_time_millis() / 1000 / 60) as i32;
            stats.add_hits_and_access_time(
                payload.num_hits(),
                last_access_time_minutes,
                stored_page.creation_time_minutes(),
            );
            tables.put_stats(previous.as_ref(), &stats)?;
            all_stats.push(stats);
        }

        Ok(all_stats)
    });
    schema::finish(txn, result)
}

/// Mark a page as truncated: its fill factor drops to zero so eviction
/// scans no longer surface it.
///
/// Returns the updated stats, or `None` when the page has none.
pub(crate) fn set_truncated(
    resources: &StoreResources,
    page: &TilePage,
) -> Result<Option<PageStats>, StoreError> {
    let txn = resources.db.begin_write()?;
    let result = WriteTables::open(&txn).and_then(|mut tables| {
        let page_id = match page.id() {
            Some(id) => Some(id),
            None => tables.get_page_id_by_key(&page.key())?,
        };

        let Some(page_id) = page_id else {
            return Ok(None);
        };
        let Some(previous) = tables.get_stats_by_page(page_id)? else {
            return Ok(None);
        };

        let mut stats = previous.clone();
        stats.set_fill_factor(0.0);
        tables.put_stats(Some(&previous), &stats)?;
        Ok(Some(stats))
    });
    schema::finish(txn, result)
}

/// Look the page up by its key, inserting it (and a fresh, not yet
/// persisted stats row) when absent.
///
/// Returns the stored page, the stats row to mutate, and the previously
/// persisted version of the stats when one exists. A created stats row only
/// reaches the engine once the caller updates and persists it.
fn resolve_or_create_page(
    tables: &mut WriteTables<'_>,
    page: &TilePage,
) -> Result<(TilePage, PageStats, Option<PageStats>), StoreError> {
    let page_key = page.key();

    match tables.get_page_id_by_key(&page_key)? {
        Some(page_id) => {
            let stored_page = tables.get_page(page_id)?.ok_or_else(|| {
                StoreError::Invariant(format!(
                    "page key '{page_key}' points at missing page row {page_id}"
                ))
            })?;
            let previous = tables.get_stats_by_page(page_id)?.ok_or_else(|| {
                StoreError::Invariant(format!("page {page_id} has no stats row"))
            })?;
            Ok((stored_page, previous.clone(), Some(previous)))
        }
        None => {
            let mut fresh = page.clone();
            tables.insert_page(&mut fresh)?;
            let page_id = fresh.id().ok_or_else(|| {
                StoreError::Invariant(format!("inserted page '{page_key}' was not assigned an id"))
            })?;
            let stats_id = tables.next_id(SEQ_PAGE_STATS)?;
            let stats = PageStats::new(stats_id, page_id);
            Ok((fresh, stats, None))
        }
    }
}
