//! Byte-count quota records.
//!
//! A [`Quota`] is either a persistent row tied to a tile set (the store keeps
//! exactly one per tile set, plus the global aggregate row) or a detached
//! value used for diffs and per-layer aggregation. Byte counts are
//! arbitrary-precision signed integers so that accounting never saturates
//! or wraps, no matter how large the cache grows.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Disk usage in bytes attributed to one tile set.
///
/// `tile_set_id` is `None` for detached values (diffs, aggregates) and
/// `Some` for rows persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    id: u64,
    tile_set_id: Option<String>,
    bytes: BigInt,
}

impl Quota {
    /// Create a detached quota of zero bytes.
    pub fn new() -> Self {
        Self {
            id: 0,
            tile_set_id: None,
            bytes: BigInt::from(0),
        }
    }

    /// Create a detached quota holding the given byte count.
    pub fn with_bytes(bytes: impl Into<BigInt>) -> Self {
        Self {
            id: 0,
            tile_set_id: None,
            bytes: bytes.into(),
        }
    }

    /// Create a zero-byte quota row for a tile set.
    pub(crate) fn for_tile_set(id: u64, tile_set_id: impl Into<String>) -> Self {
        Self {
            id,
            tile_set_id: Some(tile_set_id.into()),
            bytes: BigInt::from(0),
        }
    }

    /// Row identifier. Zero for detached values.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The tile set this row accounts for, if persistent.
    pub fn tile_set_id(&self) -> Option<&str> {
        self.tile_set_id.as_deref()
    }

    /// Current byte count.
    pub fn bytes(&self) -> &BigInt {
        &self.bytes
    }

    /// Add another quota's bytes to this one.
    pub fn add(&mut self, other: &Quota) {
        self.bytes += &other.bytes;
    }

    /// Add a raw byte count.
    pub fn add_bytes(&mut self, bytes: &BigInt) {
        self.bytes += bytes;
    }

    /// Subtract a raw byte count.
    pub fn subtract_bytes(&mut self, bytes: &BigInt) {
        self.bytes -= bytes;
    }

    /// Human-readable rendering, e.g. `"1.50 MiB"`.
    ///
    /// Precision is sacrificed for readability; use [`Quota::bytes`] for
    /// exact accounting.
    pub fn to_nice_string(&self) -> String {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let approx = self.bytes.to_f64().unwrap_or(f64::INFINITY);
        let sign = if approx < 0.0 { "-" } else { "" };
        let mut magnitude = approx.abs();

        let mut unit = 0;
        while magnitude >= 1024.0 && unit < UNITS.len() - 1 {
            magnitude /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            format!("{}{:.0} {}", sign, magnitude, UNITS[unit])
        } else {
            format!("{}{:.2} {}", sign, magnitude, UNITS[unit])
        }
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::new()
    }
}
