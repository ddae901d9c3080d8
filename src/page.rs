//! Tile pages and their usage statistics.
//!
//! A tile page is a rectangular block of tiles at one zoom level and is the
//! unit of eviction. Its statistics row tracks how full the page is on disk
//! and how often it is hit, and derives the two float scores that the
//! ordered eviction indexes are keyed by.

use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Minutes elapsed since the Unix epoch, truncated.
pub(crate) fn current_time_minutes() -> i32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    (millis / 1000 / 60) as i32
}

/// A rectangular block of tiles at one zoom level.
///
/// Pages are identified two ways: a machine-assigned 64-bit id handed out
/// by the store on first insert, and a deterministic page key derived from
/// the owning tile set and the page coordinates. Externally constructed
/// pages carry no id until the store has seen them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePage {
    id: Option<u64>,
    tile_set_id: String,
    page_x: u32,
    page_y: u32,
    zoom_level: u8,
    creation_time_minutes: i32,
}

impl TilePage {
    /// Create a page for the given tile set and coordinates, stamped with
    /// the current time.
    pub fn new(tile_set_id: impl Into<String>, page_x: u32, page_y: u32, zoom_level: u8) -> Self {
        Self::with_creation_time(tile_set_id, page_x, page_y, zoom_level, current_time_minutes())
    }

    /// Create a page with an explicit creation time in minutes since epoch.
    pub fn with_creation_time(
        tile_set_id: impl Into<String>,
        page_x: u32,
        page_y: u32,
        zoom_level: u8,
        creation_time_minutes: i32,
    ) -> Self {
        Self {
            id: None,
            tile_set_id: tile_set_id.into(),
            page_x,
            page_y,
            zoom_level,
            creation_time_minutes,
        }
    }

    /// Machine-assigned id, present once the store has inserted the page.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: u64) {
        self.id = Some(id);
    }

    /// Id of the owning tile set.
    pub fn tile_set_id(&self) -> &str {
        &self.tile_set_id
    }

    /// Page column.
    pub fn page_x(&self) -> u32 {
        self.page_x
    }

    /// Page row.
    pub fn page_y(&self) -> u32 {
        self.page_y
    }

    /// Zoom level the page lives at.
    pub fn zoom_level(&self) -> u8 {
        self.zoom_level
    }

    /// Creation time in minutes since epoch.
    pub fn creation_time_minutes(&self) -> i32 {
        self.creation_time_minutes
    }

    /// Deterministic key, unique across all pages of all tile sets.
    pub fn key(&self) -> String {
        format!(
            "{}@{},{},{}",
            self.tile_set_id, self.page_x, self.page_y, self.zoom_level
        )
    }
}

/// Usage statistics for one tile page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    id: u64,
    page_id: u64,
    frequency_of_use_per_minute: f32,
    last_access_time_minutes: i32,
    fill_factor: f32,
}

impl PageStats {
    pub(crate) fn new(id: u64, page_id: u64) -> Self {
        Self {
            id,
            page_id,
            frequency_of_use_per_minute: 0.0,
            last_access_time_minutes: 0,
            fill_factor: 0.0,
        }
    }

    /// Stats row id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the page these stats describe.
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    /// Fraction in [0, 1] of the page's tile slots present on disk.
    pub fn fill_factor(&self) -> f32 {
        self.fill_factor
    }

    /// Estimated hit rate per minute over the page's lifetime.
    pub fn frequency_of_use_per_minute(&self) -> f32 {
        self.frequency_of_use_per_minute
    }

    /// Last access time in minutes since epoch.
    pub fn last_access_time_minutes(&self) -> i32 {
        self.last_access_time_minutes
    }

    /// Key for the least-recently-used eviction index.
    ///
    /// The negated access time; the ordered index scans ascending.
    pub fn lru_score(&self) -> f32 {
        -(self.last_access_time_minutes as f32)
    }

    /// Key for the least-frequently-used eviction index.
    pub fn lfu_score(&self) -> f32 {
        self.frequency_of_use_per_minute
    }

    /// Account for tiles added to (or, when negative, removed from) the
    /// page, adjusting the fill factor.
    ///
    /// `tiles_per_page` is the page's total tile capacity; the division is
    /// done in floating point and the result clamped to [0, 1].
    pub fn add_tiles(&mut self, num_tiles: i64, tiles_per_page: &BigUint) {
        let capacity = tiles_per_page.to_f32().unwrap_or(f32::INFINITY);
        self.fill_factor = (self.fill_factor + num_tiles as f32 / capacity).clamp(0.0, 1.0);
    }

    /// Fold new hits into the frequency estimate and move the access time
    /// forward.
    ///
    /// The previous cumulative hit count is recovered from the stored rate
    /// (`prev frequency x prev age`) so that the estimate stays a true
    /// hits-per-minute over the page's lifetime:
    ///
    /// * `age = max(1, last_access - creation)`
    /// * `frequency = (prev_hits + num_hits) / age`
    pub fn add_hits_and_access_time(
        &mut self,
        num_hits: u64,
        last_access_time_minutes: i32,
        creation_time_minutes: i32,
    ) {
        let prev_age = (self.last_access_time_minutes - creation_time_minutes).max(1) as f32;
        let prev_hits = self.frequency_of_use_per_minute * prev_age;

        let age = (last_access_time_minutes - creation_time_minutes).max(1) as f32;
        self.frequency_of_use_per_minute = (prev_hits + num_hits as f32) / age;
        self.last_access_time_minutes = last_access_time_minutes;
    }

    pub(crate) fn set_fill_factor(&mut self, fill_factor: f32) {
        self.fill_factor = fill_factor;
    }
}

/// Per-page update carried by the bulk mutation operations.
///
/// One payload can carry both a tile-count diff (for quota accounting) and
/// a hit batch (for access statistics); each operation reads the fields it
/// cares about.
#[derive(Debug, Clone)]
pub struct PageStatsPayload {
    page: TilePage,
    num_tiles: i64,
    num_hits: u64,
    last_access_time_millis: u64,
}

impl PageStatsPayload {
    /// Create an empty payload for the given page.
    pub fn new(page: TilePage) -> Self {
        Self {
            page,
            num_tiles: 0,
            num_hits: 0,
            last_access_time_millis: 0,
        }
    }

    /// Set the tile-count diff (may be negative for deletions).
    pub fn with_num_tiles(mut self, num_tiles: i64) -> Self {
        self.num_tiles = num_tiles;
        self
    }

    /// Set the hit count and the access timestamp in milliseconds since
    /// epoch.
    pub fn with_hits(mut self, num_hits: u64, last_access_time_millis: u64) -> Self {
        self.num_hits = num_hits;
        self.last_access_time_millis = last_access_time_millis;
        self
    }

    /// The page the payload refers to.
    pub fn page(&self) -> &TilePage {
        &self.page
    }

    /// Tile-count diff.
    pub fn num_tiles(&self) -> i64 {
        self.num_tiles
    }

    /// Number of hits to fold in.
    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    /// Access timestamp in milliseconds since epoch.
    pub fn last_access_time_millis(&self) -> u64 {
        self.last_access_time_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─────────────────────────────────────────────────────────────────────────
    // Page identity
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn page_key_is_deterministic() {
        let page = TilePage::with_creation_time("roads#EPSG:900913#png", 3, 7, 12, 1000);
        assert_eq!(page.key(), "roads#EPSG:900913#png@3,7,12");
    }

    #[test]
    fn new_page_has_no_id() {
        let page = TilePage::new("roads#EPSG:900913#png", 0, 0, 0);
        assert!(page.id().is_none());
    }

    #[test]
    fn assign_id_sticks() {
        let mut page = TilePage::with_creation_time("roads#EPSG:900913#png", 0, 0, 0, 1000);
        page.assign_id(42);
        assert_eq!(page.id(), Some(42));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fill factor
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn add_tiles_accumulates_fill_factor() {
        let mut stats = PageStats::new(1, 10);
        let capacity = BigUint::from(10u32);

        stats.add_tiles(3, &capacity);
        assert!((stats.fill_factor() - 0.3).abs() < 1e-6);

        stats.add_tiles(2, &capacity);
        assert!((stats.fill_factor() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn add_tiles_clamps_to_one() {
        let mut stats = PageStats::new(1, 10);
        stats.add_tiles(50, &BigUint::from(10u32));
        assert_eq!(stats.fill_factor(), 1.0);
    }

    #[test]
    fn add_tiles_clamps_to_zero() {
        let mut stats = PageStats::new(1, 10);
        stats.add_tiles(3, &BigUint::from(10u32));
        stats.add_tiles(-8, &BigUint::from(10u32));
        assert_eq!(stats.fill_factor(), 0.0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hit frequency and scores
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn first_hits_divide_by_age() {
        let mut stats = PageStats::new(1, 10);
        // created at minute 0, accessed at minute 10: 5 hits over 10 minutes
        stats.add_hits_and_access_time(5, 10, 0);

        assert!((stats.frequency_of_use_per_minute() - 0.5).abs() < 1e-6);
        assert_eq!(stats.last_access_time_minutes(), 10);
    }

    #[test]
    fn frequency_preserves_cumulative_count() {
        let mut stats = PageStats::new(1, 10);
        stats.add_hits_and_access_time(5, 10, 0); // 5 hits, age 10 -> 0.5/min
        stats.add_hits_and_access_time(5, 20, 0); // 10 hits, age 20 -> 0.5/min

        assert!((stats.frequency_of_use_per_minute() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn age_is_at_least_one_minute() {
        let mut stats = PageStats::new(1, 10);
        // accessed the same minute it was created
        stats.add_hits_and_access_time(7, 100, 100);
        assert!((stats.frequency_of_use_per_minute() - 7.0).abs() < 1e-6);
    }

    #[test]
    fn lru_score_is_negated_access_time() {
        let mut stats = PageStats::new(1, 10);
        stats.add_hits_and_access_time(1, 600, 0);
        assert_eq!(stats.lru_score(), -600.0);
    }

    #[test]
    fn lfu_score_tracks_frequency() {
        let mut stats = PageStats::new(1, 10);
        stats.add_hits_and_access_time(4, 2, 0);
        assert_eq!(stats.lfu_score(), stats.frequency_of_use_per_minute());
    }

    #[test]
    fn truncation_resets_fill_only() {
        let mut stats = PageStats::new(1, 10);
        stats.add_tiles(5, &BigUint::from(10u32));
        stats.add_hits_and_access_time(3, 30, 0);

        stats.set_fill_factor(0.0);

        assert_eq!(stats.fill_factor(), 0.0);
        assert!(stats.frequency_of_use_per_minute() > 0.0);
        assert_eq!(stats.last_access_time_minutes(), 30);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payload
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn payload_builder() {
        let page = TilePage::with_creation_time("roads#EPSG:900913#png", 1, 2, 3, 1000);
        let payload = PageStatsPayload::new(page.clone())
            .with_num_tiles(4)
            .with_hits(9, 540_000);

        assert_eq!(payload.page(), &page);
        assert_eq!(payload.num_tiles(), 4);
        assert_eq!(payload.num_hits(), 9);
        assert_eq!(payload.last_access_time_millis(), 540_000);
    }
}
