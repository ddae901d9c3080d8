//! One-shot startup reconciliation.
//!
//! Runs as the first unit of work after the store opens, inside a single
//! transaction:
//!
//! 1. Seed the sentinel tile set and the zero-byte global quota row on
//!    first run.
//! 2. Cascade-delete accounting for layers the calculator no longer knows.
//!    Failures are logged per layer and do not stop the remaining layers
//!    or the surrounding transaction.
//! 3. Create missing tile sets (with zero quota rows) for every known
//!    layer.

use tracing::{debug, info, warn};

use super::mutations;
use super::schema::{self, WriteTables, SEQ_QUOTA};
use super::worker::StoreResources;
use crate::calculator::TilePageCalculator;
use crate::error::StoreError;
use crate::quota::Quota;
use crate::tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Reconcile the store against the calculator's view of the world.
pub(crate) fn initialize(resources: &StoreResources) -> Result<(), StoreError> {
    let txn = resources.db.begin_write()?;
    let result = WriteTables::open(&txn)
        .and_then(|mut tables| run(&mut tables, resources.calculator.as_ref()));
    schema::finish(txn, result)
}

fn run(
    tables: &mut WriteTables<'_>,
    calculator: &dyn TilePageCalculator,
) -> Result<(), StoreError> {
    if tables.get_quota_by_tile_set(GLOBAL_QUOTA_ID)?.is_none() {
        debug!("First time run: creating global quota row");
        // the quota -> tile set relationship holds for the global row too
        tables.put_tile_set(&TileSet::global())?;
        let quota_id = tables.next_id(SEQ_QUOTA)?;
        tables.put_quota(&Quota::for_tile_set(quota_id, GLOBAL_QUOTA_ID))?;
    }

    let known_layers = calculator.layer_names();
    let present_layers = schema::layer_names(&tables.tilesets_by_layer)?;

    for layer_name in present_layers.difference(&known_layers) {
        info!(
            layer = %layer_name,
            "Deleting disk quota information for layer as it does not exist anymore"
        );
        if let Err(err) = mutations::delete_layer_in(tables, layer_name) {
            warn!(
                layer = %layer_name,
                error = %err,
                "Error deleting disk quota information for layer"
            );
        }
    }

    for layer_name in &known_layers {
        for tile_set in calculator.tile_sets_for(layer_name) {
            if tables.get_tile_set(tile_set.id())?.is_none() {
                debug!(tile_set = %tile_set.id(), "Creating tile set for quota tracking");
                tables.put_tile_set(&tile_set)?;
                let quota_id = tables.next_id(SEQ_QUOTA)?;
                tables.put_quota(&Quota::for_tile_set(quota_id, tile_set.id()))?;
            }
        }
    }

    Ok(())
}
