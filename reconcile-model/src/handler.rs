use crate::{AttrMap, Entity};
use reconcile_types::NaturalKey;

/// Optional per-model hooks invoked by the apply engine.
///
/// Most models do NOT need this. The generic engine writes every model the
/// same way based on its `EntitySchema`.
///
/// Implement it only when a model needs:
/// - Validation beyond what the schema expresses
/// - Field defaults or rewrites before a row is written
/// - A veto on deletes (e.g. rows still referenced outside this sync)
pub trait ModelHandler: Send + Sync {
    /// Validate a source entity before it is created or updated.
    /// Return `Err(message)` to fail the changeset entry.
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        let _ = entity;
        Ok(())
    }

    /// Adjust the fields of a row about to be created.
    fn before_create(&self, entity: &Entity, fields: &mut AttrMap) -> Result<(), String> {
        let _ = (entity, fields);
        Ok(())
    }

    /// Adjust the changed-field subset of an update.
    fn before_update(&self, key: &NaturalKey, changes: &mut AttrMap) -> Result<(), String> {
        let _ = (key, changes);
        Ok(())
    }

    /// Whether the target entity may be deleted (or soft-deleted).
    fn allow_delete(&self, entity: &Entity) -> bool {
        let _ = entity;
        true
    }
}
