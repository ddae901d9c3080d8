//! Table layout and record codec for the quota page store.
//!
//! Primary rows are bincode-serialized structs keyed by their id. Secondary
//! indexes are separate tables maintained in the same transaction as the
//! primary row: unique indexes map the secondary key to the primary id,
//! ordered indexes use composite `(key, id)` tuples with a unit value so
//! the engine's key order doubles as scan order, ties broken by id.

use std::collections::HashSet;

use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::keys::score_key;
use crate::error::StoreError;
use crate::page::{PageStats, TilePage};
use crate::quota::Quota;
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Tile set rows keyed by tile set id.
pub(crate) const TILESETS: TableDefinition<&str, &[u8]> = TableDefinition::new("tilesets");

/// Layer membership index: `(layer_name, tile_set_id)`.
pub(crate) const TILESETS_BY_LAYER: TableDefinition<(&str, &str), ()> =
    TableDefinition::new("tilesets_by_layer");

/// Tile page rows keyed by machine-assigned id.
pub(crate) const PAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("pages");

/// Unique page-key index: page key to page id.
pub(crate) const PAGE_BY_KEY: TableDefinition<&str, u64> = TableDefinition::new("page_by_key");

/// Page statistics rows keyed by stats id.
pub(crate) const PAGE_STATS: TableDefinition<u64, &[u8]> = TableDefinition::new("page_stats");

/// Unique index: page id to stats id.
pub(crate) const PAGE_STATS_BY_PAGE: TableDefinition<u64, u64> =
    TableDefinition::new("page_stats_by_page");

/// Ordered eviction index: `(encoded LRU score, stats id)`.
pub(crate) const PAGE_STATS_BY_LRU: TableDefinition<(u32, u64), ()> =
    TableDefinition::new("page_stats_by_lru");

/// Ordered eviction index: `(encoded LFU score, stats id)`.
pub(crate) const PAGE_STATS_BY_LFU: TableDefinition<(u32, u64), ()> =
    TableDefinition::new("page_stats_by_lfu");

/// Quota rows keyed by quota id.
pub(crate) const QUOTAS: TableDefinition<u64, &[u8]> = TableDefinition::new("quotas");

/// Unique index: tile set id to quota id.
pub(crate) const QUOTA_BY_TILESET: TableDefinition<&str, u64> =
    TableDefinition::new("quota_by_tileset");

/// Id allocation counters, one row per sequence name.
pub(crate) const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub(crate) const SEQ_PAGE: &str = "page";
pub(crate) const SEQ_PAGE_STATS: &str = "page_stats";
pub(crate) const SEQ_QUOTA: &str = "quota";

/// Create every table so later read transactions never race table creation.
pub(crate) fn ensure_tables(db: &Database) -> Result<(), StoreError> {
    let txn = db.begin_write()?;
    {
        txn.open_table(TILESETS)?;
        txn.open_table(TILESETS_BY_LAYER)?;
        txn.open_table(PAGES)?;
        txn.open_table(PAGE_BY_KEY)?;
        txn.open_table(PAGE_STATS)?;
        txn.open_table(PAGE_STATS_BY_PAGE)?;
        txn.open_table(PAGE_STATS_BY_LRU)?;
        txn.open_table(PAGE_STATS_BY_LFU)?;
        txn.open_table(QUOTAS)?;
        txn.open_table(QUOTA_BY_TILESET)?;
        txn.open_table(SEQUENCES)?;
    }
    txn.commit()?;
    Ok(())
}

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(record)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Commit on success, abort on failure, passing the unit's result through.
pub(crate) fn finish<T>(
    txn: WriteTransaction,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = txn.abort() {
                warn!(error = %abort_err, "Failed to abort quota store transaction");
            }
            Err(err)
        }
    }
}

/// Tile set ids belonging to a layer, in id order.
pub(crate) fn layer_tile_set_ids<T>(table: &T, layer_name: &str) -> Result<Vec<String>, StoreError>
where
    T: ReadableTable<(&'static str, &'static str), ()>,
{
    let mut ids = Vec::new();
    for entry in table.range((layer_name, "")..)? {
        let (key, _) = entry?;
        let (entry_layer, tile_set_id) = key.value();
        if entry_layer != layer_name {
            break;
        }
        ids.push(tile_set_id.to_string());
    }
    Ok(ids)
}

/// Distinct layer names present in the store, excluding the sentinel.
pub(crate) fn layer_names<T>(table: &T) -> Result<HashSet<String>, StoreError>
where
    T: ReadableTable<(&'static str, &'static str), ()>,
{
    let mut names = HashSet::new();
    for entry in table.iter()? {
        let (key, _) = entry?;
        let (layer_name, _) = key.value();
        if layer_name != GLOBAL_QUOTA_ID {
            names.insert(layer_name.to_string());
        }
    }
    Ok(names)
}

/// `(page_key, page_id)` pairs whose page key starts with the given prefix.
pub(crate) fn pages_with_key_prefix<T>(
    table: &T,
    prefix: &str,
) -> Result<Vec<(String, u64)>, StoreError>
where
    T: ReadableTable<&'static str, u64>,
{
    let mut pages = Vec::new();
    for entry in table.range(prefix..)? {
        let (key, page_id) = entry?;
        let page_key = key.value();
        if !page_key.starts_with(prefix) {
            break;
        }
        pages.push((page_key.to_string(), page_id.value()));
    }
    Ok(pages)
}

/// Every table of the schema, opened against one write transaction.
///
/// All mutating units of work go through this struct so that primary rows
/// and their index entries never drift apart.
pub(crate) struct WriteTables<'txn> {
    pub(crate) tilesets: Table<'txn, &'static str, &'static [u8]>,
    pub(crate) tilesets_by_layer: Table<'txn, (&'static str, &'static str), ()>,
    pub(crate) pages: Table<'txn, u64, &'static [u8]>,
    pub(crate) page_by_key: Table<'txn, &'static str, u64>,
    pub(crate) page_stats: Table<'txn, u64, &'static [u8]>,
    pub(crate) page_stats_by_page: Table<'txn, u64, u64>,
    pub(crate) page_stats_by_lru: Table<'txn, (u32, u64), ()>,
    pub(crate) page_stats_by_lfu: Table<'txn, (u32, u64), ()>,
    pub(crate) quotas: Table<'txn, u64, &'static [u8]>,
    pub(crate) quota_by_tileset: Table<'txn, &'static str, u64>,
    pub(crate) sequences: Table<'txn, &'static str, u64>,
}

impl<'txn> WriteTables<'txn> {
    pub(crate) fn open(txn: &'txn WriteTransaction) -> Result<Self, StoreError> {
        Ok(Self {
            tilesets: txn.open_table(TILESETS)?,
            tilesets_by_layer: txn.open_table(TILESETS_BY_LAYER)?,
            pages: txn.open_table(PAGES)?,
            page_by_key: txn.open_table(PAGE_BY_KEY)?,
            page_stats: txn.open_table(PAGE_STATS)?,
            page_stats_by_page: txn.open_table(PAGE_STATS_BY_PAGE)?,
            page_stats_by_lru: txn.open_table(PAGE_STATS_BY_LRU)?,
            page_stats_by_lfu: txn.open_table(PAGE_STATS_BY_LFU)?,
            quotas: txn.open_table(QUOTAS)?,
            quota_by_tileset: txn.open_table(QUOTA_BY_TILESET)?,
            sequences: txn.open_table(SEQUENCES)?,
        })
    }

    /// Allocate the next id from a named sequence. Ids start at 1.
    pub(crate) fn next_id(&mut self, sequence: &str) -> Result<u64, StoreError> {
        let next = self
            .sequences
            .get(sequence)?
            .map(|value| value.value())
            .unwrap_or(1);
        self.sequences.insert(sequence, next + 1)?;
        Ok(next)
    }

    pub(crate) fn get_tile_set(&self, id: &str) -> Result<Option<TileSet>, StoreError> {
        match self.tilesets.get(id)? {
            Some(raw) => Ok(Some(decode(raw.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_tile_set(&mut self, tile_set: &TileSet) -> Result<(), StoreError> {
        let bytes = encode(tile_set)?;
        self.tilesets.insert(tile_set.id(), bytes.as_slice())?;
        self.tilesets_by_layer
            .insert((tile_set.layer_name(), tile_set.id()), ())?;
        Ok(())
    }

    pub(crate) fn remove_tile_set(&mut self, id: &str, layer_name: &str) -> Result<(), StoreError> {
        self.tilesets.remove(id)?;
        self.tilesets_by_layer.remove((layer_name, id))?;
        Ok(())
    }

    pub(crate) fn get_quota_by_tile_set(
        &self,
        tile_set_id: &str,
    ) -> Result<Option<Quota>, StoreError> {
        let Some(quota_id) = self
            .quota_by_tileset
            .get(tile_set_id)?
            .map(|value| value.value())
        else {
            return Ok(None);
        };
        match self.quotas.get(quota_id)? {
            Some(raw) => Ok(Some(decode(raw.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_quota(&mut self, quota: &Quota) -> Result<(), StoreError> {
        let tile_set_id = quota.tile_set_id().ok_or_else(|| {
            StoreError::Invariant("refusing to persist a quota row without a tile set id".into())
        })?;
        let bytes = encode(quota)?;
        self.quotas.insert(quota.id(), bytes.as_slice())?;
        self.quota_by_tileset.insert(tile_set_id, quota.id())?;
        Ok(())
    }

    pub(crate) fn remove_quota(&mut self, quota: &Quota) -> Result<(), StoreError> {
        self.quotas.remove(quota.id())?;
        if let Some(tile_set_id) = quota.tile_set_id() {
            self.quota_by_tileset.remove(tile_set_id)?;
        }
        Ok(())
    }

    pub(crate) fn get_page(&self, page_id: u64) -> Result<Option<TilePage>, StoreError> {
        match self.pages.get(page_id)? {
            Some(raw) => Ok(Some(decode(raw.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn get_page_id_by_key(&self, page_key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.page_by_key.get(page_key)?.map(|value| value.value()))
    }

    /// Insert a new page, assigning it a fresh id.
    pub(crate) fn insert_page(&mut self, page: &mut TilePage) -> Result<(), StoreError> {
        let id = self.next_id(SEQ_PAGE)?;
        page.assign_id(id);
        let bytes = encode(page)?;
        self.pages.insert(id, bytes.as_slice())?;
        let key = page.key();
        self.page_by_key.insert(key.as_str(), id)?;
        Ok(())
    }

    pub(crate) fn get_stats_by_page(&self, page_id: u64) -> Result<Option<PageStats>, StoreError> {
        let Some(stats_id) = self
            .page_stats_by_page
            .get(page_id)?
            .map(|value| value.value())
        else {
            return Ok(None);
        };
        match self.page_stats.get(stats_id)? {
            Some(raw) => Ok(Some(decode(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Persist a stats row and refresh its eviction index entries.
    ///
    /// `previous` must be the stored version being replaced, or `None` when
    /// the row is new; its scores locate the stale index entries.
    pub(crate) fn put_stats(
        &mut self,
        previous: Option<&PageStats>,
        stats: &PageStats,
    ) -> Result<(), StoreError> {
        match previous {
            Some(previous) => {
                self.page_stats_by_lru
                    .remove((score_key(previous.lru_score()), previous.id()))?;
                self.page_stats_by_lfu
                    .remove((score_key(previous.lfu_score()), previous.id()))?;
            }
            None => {
                self.page_stats_by_page.insert(stats.page_id(), stats.id())?;
            }
        }

        let bytes = encode(stats)?;
        self.page_stats.insert(stats.id(), bytes.as_slice())?;
        self.page_stats_by_lru
            .insert((score_key(stats.lru_score()), stats.id()), ())?;
        self.page_stats_by_lfu
            .insert((score_key(stats.lfu_score()), stats.id()), ())?;
        Ok(())
    }

    /// Delete a page row, its key index entry, and any stats attached to it.
    pub(crate) fn remove_page_and_stats(
        &mut self,
        page_key: &str,
        page_id: u64,
    ) -> Result<(), StoreError> {
        self.page_by_key.remove(page_key)?;
        self.pages.remove(page_id)?;

        let stats_id = self
            .page_stats_by_page
            .remove(page_id)?
            .map(|value| value.value());
        if let Some(stats_id) = stats_id {
            let stats = match self.page_stats.remove(stats_id)? {
                Some(raw) => Some(decode::<PageStats>(raw.value())?),
                None => None,
            };
            if let Some(stats) = stats {
                self.page_stats_by_lru
                    .remove((score_key(stats.lru_score()), stats_id))?;
                self.page_stats_by_lfu
                    .remove((score_key(stats.lfu_score()), stats_id))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::TableHandle;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Database {
        Database::create(dir.path().join("schema_test.redb")).unwrap()
    }

    #[test]
    fn table_names_are_unique() {
        let names = [
            TILESETS.name(),
            TILESETS_BY_LAYER.name(),
            PAGES.name(),
            PAGE_BY_KEY.name(),
            PAGE_STATS.name(),
            PAGE_STATS_BY_PAGE.name(),
            PAGE_STATS_BY_LRU.name(),
            PAGE_STATS_BY_LFU.name(),
            QUOTAS.name(),
            QUOTA_BY_TILESET.name(),
            SEQUENCES.name(),
        ];

        let mut sorted = names.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len(), "table names must be unique");
    }

    #[test]
    fn sequences_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        ensure_tables(&db).unwrap();

        let txn = db.begin_write().unwrap();
        {
            let mut tables = WriteTables::open(&txn).unwrap();
            assert_eq!(tables.next_id(SEQ_PAGE).unwrap(), 1);
            assert_eq!(tables.next_id(SEQ_PAGE).unwrap(), 2);
            assert_eq!(tables.next_id(SEQ_PAGE_STATS).unwrap(), 1);
            assert_eq!(tables.next_id(SEQ_PAGE).unwrap(), 3);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn layer_range_does_not_bleed_into_sibling_layers() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        ensure_tables(&db).unwrap();

        let txn = db.begin_write().unwrap();
        {
            let mut tables = WriteTables::open(&txn).unwrap();
            tables
                .tilesets_by_layer
                .insert(("roads", "roads#a"), ())
                .unwrap();
            tables
                .tilesets_by_layer
                .insert(("roads", "roads#b"), ())
                .unwrap();
            // lexicographic sibling of "roads"
            tables
                .tilesets_by_layer
                .insert(("roads2", "roads2#a"), ())
                .unwrap();

            let ids = layer_tile_set_ids(&tables.tilesets_by_layer, "roads").unwrap();
            assert_eq!(ids, vec!["roads#a".to_string(), "roads#b".to_string()]);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn page_key_prefix_scan_respects_boundaries() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        ensure_tables(&db).unwrap();

        let txn = db.begin_write().unwrap();
        {
            let mut tables = WriteTables::open(&txn).unwrap();
            tables.page_by_key.insert("t1@0,0,1", 1).unwrap();
            tables.page_by_key.insert("t1@0,1,1", 2).unwrap();
            tables.page_by_key.insert("t10@0,0,1", 3).unwrap();

            let pages = pages_with_key_prefix(&tables.page_by_key, "t1@").unwrap();
            let ids: Vec<u64> = pages.iter().map(|(_, id)| *id).collect();
            assert_eq!(ids, vec![1, 2]);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn put_stats_replaces_index_entries() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        ensure_tables(&db).unwrap();

        let txn = db.begin_write().unwrap();
        {
            let mut tables = WriteTables::open(&txn).unwrap();

            let mut stats = PageStats::new(7, 99);
            stats.add_hits_and_access_time(1, 10, 0);
            tables.put_stats(None, &stats).unwrap();

            let mut updated = stats.clone();
            updated.add_hits_and_access_time(1, 20, 0);
            tables.put_stats(Some(&stats), &updated).unwrap();

            let entries: Vec<(u32, u64)> = tables
                .page_stats_by_lru
                .iter()
                .unwrap()
                .map(|entry| entry.unwrap().0.value())
                .collect();
            assert_eq!(entries.len(), 1, "stale LRU entry must be removed");
            assert_eq!(entries[0].1, 7);
        }
        txn.commit().unwrap();
    }
}
