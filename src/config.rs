//! Store configuration.

use std::time::Duration;

/// Default name of the store subdirectory under the cache root.
pub const DEFAULT_STORE_SUBDIR: &str = "diskquota_page_store";

/// Default name of the database file inside the store subdirectory.
pub const DEFAULT_DATABASE_FILE: &str = "quota_pages.redb";

/// Default deadline for draining outstanding units of work on close.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the quota page store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Subdirectory under the cache root that the store owns.
    pub store_subdir: String,
    /// Database file name inside the store subdirectory.
    pub database_file: String,
    /// How long `close` waits for queued units of work to drain.
    pub shutdown_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_subdir: DEFAULT_STORE_SUBDIR.to_string(),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Set the store subdirectory name.
    pub fn with_store_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.store_subdir = subdir.into();
        self
    }

    /// Set the database file name.
    pub fn with_database_file(mut self, file: impl Into<String>) -> Self {
        self.database_file = file.into();
        self
    }

    /// Set the shutdown drain deadline.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.store_subdir, "diskquota_page_store");
        assert_eq!(config.database_file, "quota_pages.redb");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::default()
            .with_store_subdir("quota_test")
            .with_database_file("pages.redb")
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.store_subdir, "quota_test");
        assert_eq!(config.database_file, "pages.redb");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
