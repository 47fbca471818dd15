//! A cache of indexes known to exist on the deployment.
use crate::error::Result;

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct IndexCacheKey {
    database: String,
    collection: String,
    index: String,
}

impl IndexCacheKey {
    fn new(database: &str, collection: &str, index: &str) -> IndexCacheKey {
        IndexCacheKey {
            database: database.to_owned(),
            collection: collection.to_owned(),
            index: index.to_owned(),
        }
    }
}

/// Tracks which indexes are believed to exist, so repeated ensure-index
/// calls can skip the server round-trip.
///
/// Presence of an entry means "believed to exist"; absence means unknown,
/// not "does not exist". Entries are only removed by the explicit reset
/// operations, which callers invoke when external changes (a collection or
/// database drop) may have invalidated the cache.
pub struct IndexCache {
    entries: Mutex<HashSet<IndexCacheKey>>,
}

impl IndexCache {
    pub fn new() -> IndexCache {
        IndexCache {
            entries: Mutex::new(HashSet::new()),
        }
    }

    /// Records that the index is known to exist.
    pub fn add(&self, database: &str, collection: &str, index: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.insert(IndexCacheKey::new(database, collection, index));
        Ok(())
    }

    /// Reports whether the index is believed to exist.
    pub fn contains(&self, database: &str, collection: &str, index: &str) -> Result<bool> {
        let entries = self.entries.lock()?;
        Ok(entries.contains(&IndexCacheKey::new(database, collection, index)))
    }

    /// Forgets a single index.
    pub fn remove(&self, database: &str, collection: &str, index: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.remove(&IndexCacheKey::new(database, collection, index));
        Ok(())
    }

    /// Forgets every cached index.
    pub fn reset(&self) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.clear();
        Ok(())
    }

    /// Forgets every cached index within a database.
    pub fn reset_database(&self, database: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.retain(|key| key.database != database);
        Ok(())
    }

    /// Forgets every cached index within a collection.
    pub fn reset_collection(&self, database: &str, collection: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.retain(|key| key.database != database || key.collection != collection);
        Ok(())
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        IndexCache::new()
    }
}
