//! Public quota store facade.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::info;

use super::queries::{self, ExpirationPolicy};
use super::schema;
use super::worker::{StoreResources, TransactionWorker, UnitHandle};
use super::{mutations, startup};
use crate::calculator::{CacheDirLocator, GridRect, TilePageCalculator};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::page::{PageStats, PageStatsPayload, TilePage};
use crate::quota::Quota;
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Durable disk-quota accounting store for a tile cache.
///
/// Tracks how many bytes each tile set uses, aggregates usage per layer and
/// globally, records per-page usage statistics, and surfaces eviction
/// candidates under LRU or LFU policies. All state is persisted
/// transactionally; after a crash the accounting reflects committed updates
/// only.
///
/// Every operation except [`QuotaStore::tile_sets`] and
/// [`QuotaStore::tiles_for_page`] executes as a unit of work on the store's
/// single writer thread, so concurrent callers never race the coupled
/// per-tile-set/global bookkeeping.
///
/// The synchronous methods block the calling thread and must not be used
/// from an async context; the operations returning a [`UnitHandle`] can be
/// awaited instead.
pub struct QuotaStore {
    db: Arc<Database>,
    calculator: Arc<dyn TilePageCalculator>,
    worker: TransactionWorker,
}

impl QuotaStore {
    /// Open (creating if necessary) the store under the locator's cache
    /// root and reconcile it against the calculator's layers.
    ///
    /// # Errors
    ///
    /// Fails if the store directory cannot be created, the engine cannot be
    /// opened, or startup reconciliation fails; in the latter case the
    /// writer is shut down before returning.
    pub fn open(
        locator: &dyn CacheDirLocator,
        calculator: Arc<dyn TilePageCalculator>,
    ) -> Result<Self, StoreError> {
        Self::open_with_config(StoreConfig::default(), locator, calculator)
    }

    /// Open with explicit configuration.
    pub fn open_with_config(
        config: StoreConfig,
        locator: &dyn CacheDirLocator,
        calculator: Arc<dyn TilePageCalculator>,
    ) -> Result<Self, StoreError> {
        let store_directory: PathBuf = locator.default_path()?.join(&config.store_subdir);
        std::fs::create_dir_all(&store_directory)?;

        let db = Arc::new(Database::create(store_directory.join(&config.database_file))?);
        schema::ensure_tables(&db)?;
        info!(
            path = %store_directory.display(),
            "Disk quota page store configured"
        );

        let worker = TransactionWorker::spawn(
            StoreResources {
                db: Arc::clone(&db),
                calculator: Arc::clone(&calculator),
            },
            config.shutdown_timeout,
        )?;

        let store = Self {
            db,
            calculator,
            worker,
        };

        if let Err(err) = store.worker.submit_and_wait(startup::initialize) {
            store.worker.close();
            return Err(err);
        }

        let global = store.globally_used_quota()?;
        info!(global = %global.to_nice_string(), "Quota store initialized");
        Ok(store)
    }

    /// Close the store: reject new operations, drain outstanding units of
    /// work within the configured deadline, then release the engine.
    ///
    /// Idempotent; also invoked on drop.
    pub fn close(&self) {
        info!("Requesting to close quota store");
        self.worker.close();
        info!("Quota store closed");
    }

    /// The calculator this store consults for page geometry.
    pub fn tile_page_calculator(&self) -> Arc<dyn TilePageCalculator> {
        Arc::clone(&self.calculator)
    }

    /// Bytes used by the whole cache (the global aggregate row).
    pub fn globally_used_quota(&self) -> Result<Quota, StoreError> {
        self.worker
            .submit_and_wait(|resources| {
                queries::used_quota_by_tile_set_id(resources, GLOBAL_QUOTA_ID)
            })
    }

    /// Bytes used by one tile set.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoSuchTileSet`] if the tile set is not tracked.
    pub fn used_quota_by_tile_set_id(&self, tile_set_id: &str) -> Result<Quota, StoreError> {
        let tile_set_id = tile_set_id.to_string();
        self.worker
            .submit_and_wait(move |resources| {
                queries::used_quota_by_tile_set_id(resources, &tile_set_id)
            })
    }

    /// Bytes used by a layer, summed over its tile sets.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoSuchLayer`] if the layer has no tile sets.
    pub fn used_quota_by_layer(&self, layer_name: &str) -> Result<Quota, StoreError> {
        let layer_name = layer_name.to_string();
        self.worker
            .submit_and_wait(move |resources| queries::used_quota_by_layer(resources, &layer_name))
    }

    /// Snapshot of all tracked tile sets, excluding the internal global
    /// sentinel.
    ///
    /// Served from a read snapshot without going through the writer; no
    /// cross-row consistency is promised with concurrently committing
    /// units.
    pub fn tile_sets(&self) -> Result<HashSet<TileSet>, StoreError> {
        let txn = self.db.begin_read()?;
        let tilesets = txn.open_table(schema::TILESETS)?;

        let mut result = HashSet::new();
        for entry in tilesets.iter()? {
            let (_, raw) = entry?;
            let tile_set: TileSet = schema::decode(raw.value())?;
            if !tile_set.is_global() {
                result.insert(tile_set);
            }
        }
        Ok(result)
    }

    /// One tile set by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoSuchTileSet`] if absent.
    pub fn tile_set_by_id(&self, tile_set_id: &str) -> Result<TileSet, StoreError> {
        let tile_set_id = tile_set_id.to_string();
        self.worker
            .submit_and_wait(move |resources| queries::tile_set_by_id(resources, &tile_set_id))
    }

    /// Asynchronously delete all accounting owned by a layer.
    ///
    /// The freed bytes are subtracted from the global aggregate; the
    /// layer's tile sets, pages and statistics are removed in one
    /// transaction.
    pub fn delete_layer(&self, layer_name: &str) -> UnitHandle<()> {
        info!(layer = %layer_name, "Deleting disk quota information for layer");
        let layer_name = layer_name.to_string();
        self.worker
            .submit(move |resources| mutations::delete_layer(resources, &layer_name))
    }

    /// Record bytes added to (or removed from) a tile set together with the
    /// per-page tile counts that changed.
    ///
    /// The diff is applied to both the tile set's quota row and the global
    /// aggregate in the same transaction; page fill factors move by
    /// `num_tiles / tiles_per_page`. If the tile set was concurrently
    /// deleted the call is a no-op. A failure on any page aborts the whole
    /// batch.
    pub fn add_to_quota_and_tile_counts(
        &self,
        tile_set: &TileSet,
        quota_diff: &Quota,
        tile_count_diffs: Vec<PageStatsPayload>,
    ) -> Result<(), StoreError> {
        let tile_set = tile_set.clone();
        let diff = quota_diff.bytes().clone();
        self.worker.submit_and_wait(move |resources| {
            mutations::add_to_quota_and_tile_counts(resources, &tile_set, &diff, &tile_count_diffs)
        })
    }

    /// Asynchronously fold hit batches into page statistics and set access
    /// times.
    ///
    /// Payloads whose tile set vanished are skipped; the rest of the batch
    /// still commits. Resolves to the updated stats rows.
    pub fn add_hits_and_set_access_time(
        &self,
        stats_updates: Vec<PageStatsPayload>,
    ) -> UnitHandle<Vec<PageStats>> {
        self.worker.submit(move |resources| {
            mutations::add_hits_and_set_access_time(resources, &stats_updates)
        })
    }

    /// The least recently used page among the given layers, or `None` when
    /// no page with tiles on disk remains.
    pub fn least_recently_used_page(
        &self,
        layer_names: &HashSet<String>,
    ) -> Result<Option<TilePage>, StoreError> {
        self.find_page_to_expire(ExpirationPolicy::LeastRecentlyUsed, layer_names)
    }

    /// The least frequently used page among the given layers, or `None`
    /// when no page with tiles on disk remains.
    pub fn least_frequently_used_page(
        &self,
        layer_names: &HashSet<String>,
    ) -> Result<Option<TilePage>, StoreError> {
        self.find_page_to_expire(ExpirationPolicy::LeastFrequentlyUsed, layer_names)
    }

    fn find_page_to_expire(
        &self,
        policy: ExpirationPolicy,
        layer_names: &HashSet<String>,
    ) -> Result<Option<TilePage>, StoreError> {
        let layer_names: Vec<String> = layer_names.iter().cloned().collect();
        self.worker.submit_and_wait(move |resources| {
            queries::find_page_to_expire(resources, policy, &layer_names)
        })
    }

    /// Mark a page truncated (fill factor zero) so eviction scans skip it.
    ///
    /// Returns the updated stats, or `None` when the page has no stats row.
    pub fn set_truncated(&self, page: &TilePage) -> Result<Option<PageStats>, StoreError> {
        let page = page.clone();
        self.worker
            .submit_and_wait(move |resources| mutations::set_truncated(resources, &page))
    }

    /// The grid ranges covered by a page, resolved through the calculator.
    ///
    /// Like [`QuotaStore::tile_sets`], the owning tile set is read from a
    /// snapshot without going through the writer.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoSuchTileSet`] if the page's tile set is not tracked.
    pub fn tiles_for_page(&self, page: &TilePage) -> Result<Vec<GridRect>, StoreError> {
        let txn = self.db.begin_read()?;
        let tilesets = txn.open_table(schema::TILESETS)?;
        let tile_set: TileSet = match tilesets.get(page.tile_set_id())? {
            Some(raw) => schema::decode(raw.value())?,
            None => return Err(StoreError::NoSuchTileSet(page.tile_set_id().to_string())),
        };
        Ok(self.calculator.to_grid_coverage(&tile_set, page))
    }
}

impl Drop for QuotaStore {
    fn drop(&mut self) {
        self.worker.close();
    }
}
