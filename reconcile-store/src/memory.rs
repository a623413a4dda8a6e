//! In-memory datastore.
//!
//! Holds rows in ordered maps behind a mutex. Transactions snapshot the
//! whole state on `begin` and restore it on `rollback`.

use crate::error::{ConstraintKind, StoreError, StoreResult};
use crate::row::{Link, Row, RowPatch};
use crate::Datastore;
use reconcile_types::{NaturalKey, RecordId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    rows: BTreeMap<RecordId, Row>,
    by_key: HashMap<(String, NaturalKey), RecordId>,
}

impl State {
    fn check_links<'a>(&self, links: impl Iterator<Item = &'a Link>) -> StoreResult<()> {
        for link in links {
            match self.rows.get(&link.id) {
                Some(target) if target.model_type == link.model_type => {}
                _ => {
                    return Err(StoreError::constraint(
                        ConstraintKind::ReferentialIntegrity,
                        format!("link to missing {} row {}", link.model_type, link.id),
                    ));
                }
            }
        }
        Ok(())
    }

    fn referrers(&self, id: RecordId) -> Vec<&Row> {
        self.rows
            .values()
            .filter(|r| r.id != id && r.links().any(|l| l.id == id))
            .collect()
    }
}

/// A datastore held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    snapshot: Mutex<Option<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn lock_snapshot(&self) -> StoreResult<MutexGuard<'_, Option<State>>> {
        self.snapshot.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Total number of rows across all model types.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.lock()?.rows.is_empty())
    }
}

impl Datastore for MemoryStore {
    fn list(&self, model_types: &[String]) -> StoreResult<Vec<Row>> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|r| model_types.iter().any(|m| *m == r.model_type))
            .cloned()
            .collect())
    }

    fn get(&self, id: RecordId) -> StoreResult<Option<Row>> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    fn find_by_key(&self, model_type: &str, key: &NaturalKey) -> StoreResult<Option<Row>> {
        let state = self.lock()?;
        Ok(state
            .by_key
            .get(&(model_type.to_string(), key.clone()))
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    fn insert(&self, row: &Row) -> StoreResult<()> {
        let mut state = self.lock()?;
        if row.key.arity() == 0 {
            return Err(StoreError::constraint(
                ConstraintKind::Required,
                format!("{} row without natural key", row.model_type),
            ));
        }
        let slot = (row.model_type.clone(), row.key.clone());
        if state.by_key.contains_key(&slot) || state.rows.contains_key(&row.id) {
            return Err(StoreError::constraint(
                ConstraintKind::Unique,
                format!("{} {} already exists", row.model_type, row.key),
            ));
        }
        state.check_links(row.links())?;
        state.by_key.insert(slot, row.id);
        state.rows.insert(row.id, row.clone());
        Ok(())
    }

    fn update(&self, id: RecordId, patch: &RowPatch) -> StoreResult<Row> {
        let mut state = self.lock()?;
        state.check_links(patch.links())?;
        let row = state
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.apply_patch(patch);
        Ok(row.clone())
    }

    fn delete(&self, id: RecordId) -> StoreResult<()> {
        let mut state = self.lock()?;
        let Some(row) = state.rows.get(&id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if let Some(referrer) = state.referrers(id).first() {
            return Err(StoreError::constraint(
                ConstraintKind::ReferentialIntegrity,
                format!(
                    "{} {} is still referenced by {} {}",
                    row.model_type, row.key, referrer.model_type, referrer.key
                ),
            ));
        }
        let slot = (row.model_type.clone(), row.key.clone());
        state.by_key.remove(&slot);
        state.rows.remove(&id);
        Ok(())
    }

    fn count(&self, model_type: &str) -> StoreResult<usize> {
        Ok(self
            .lock()?
            .rows
            .values()
            .filter(|r| r.model_type == model_type)
            .count())
    }

    fn begin(&self) -> StoreResult<()> {
        let mut snapshot = self.lock_snapshot()?;
        if snapshot.is_some() {
            return Err(StoreError::Transaction("transaction already open".into()));
        }
        *snapshot = Some(self.lock()?.clone());
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        self.lock_snapshot()?
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction("commit without begin".into()))
    }

    fn rollback(&self) -> StoreResult<()> {
        let saved = self
            .lock_snapshot()?
            .take()
            .ok_or_else(|| StoreError::Transaction("rollback without begin".into()))?;
        *self.lock()? = saved;
        Ok(())
    }
}
