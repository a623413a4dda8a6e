//! Per-run lookup cache.
//!
//! Remembers natural-key → row lookups that missed the loaded index, so a
//! reference resolved once costs at most one store query per run. Rows
//! created during the run are registered here as they are written. The cache
//! belongs to one target adapter and is cleared when the run ends.

use reconcile_types::{NaturalKey, RecordId};
use serde::Serialize;
use std::collections::HashMap;

/// Hit/miss counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered by the loaded index.
    pub index_hits: u64,
    /// Lookups answered by this cache (positive or negative).
    pub cache_hits: u64,
    /// Lookups that fell through to the store.
    pub store_queries: u64,
    /// Rows registered after being created during the run.
    pub registered: u64,
}

#[derive(Debug, Default)]
pub struct LookupCache {
    entries: HashMap<String, HashMap<NaturalKey, Option<RecordId>>>,
    stats: CacheStats,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(result)` when this key was looked up (or registered) before.
    pub fn get(&mut self, model_type: &str, key: &NaturalKey) -> Option<Option<RecordId>> {
        let hit = self
            .entries
            .get(model_type)
            .and_then(|m| m.get(key))
            .copied();
        if hit.is_some() {
            self.stats.cache_hits += 1;
        }
        hit
    }

    /// Records the outcome of a store query, including a miss.
    pub fn record_query(&mut self, model_type: &str, key: NaturalKey, id: Option<RecordId>) {
        self.stats.store_queries += 1;
        self.entries
            .entry(model_type.to_string())
            .or_default()
            .insert(key, id);
    }

    /// Registers a row written during this run, replacing any cached miss.
    pub fn register(&mut self, model_type: &str, key: NaturalKey, id: RecordId) {
        self.stats.registered += 1;
        self.entries
            .entry(model_type.to_string())
            .or_default()
            .insert(key, Some(id));
    }

    /// Forgets a row removed during this run.
    pub fn forget(&mut self, model_type: &str, key: &NaturalKey) {
        if let Some(m) = self.entries.get_mut(model_type) {
            m.insert(key.clone(), None);
        }
    }

    /// Drops what the cache knows about one key, so the next lookup goes
    /// back to the loaded index.
    pub fn evict(&mut self, model_type: &str, key: &NaturalKey) {
        if let Some(m) = self.entries.get_mut(model_type) {
            m.remove(key);
        }
    }

    pub(crate) fn count_index_hit(&mut self) {
        self.stats.index_hits += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry and resets the counters.
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.stats = CacheStats::default();
    }
}
