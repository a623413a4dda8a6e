//! In-memory entity index.
//!
//! Every adapter loads into an [`EntityIndex`]: model type → natural key →
//! entity. It is append-only while loading and read-only afterwards.

use reconcile_model::{AttrMap, Entity, EntitySchema, ModelResult};
use reconcile_types::NaturalKey;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// What happened to an entity handed to [`EntityIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First record for this key.
    Inserted,
    /// A full record replaced a placeholder.
    Upgraded,
    /// A placeholder arrived for a key that is already indexed; ignored.
    Kept,
    /// A second full record collided with an existing one.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct EntityIndex {
    models: HashMap<String, BTreeMap<NaturalKey, Entity>>,
    duplicates: BTreeMap<String, BTreeSet<NaturalKey>>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity.
    ///
    /// A full record upgrades a placeholder with the same key. Two full
    /// records with the same key mark that key as duplicated; the diff then
    /// leaves it out entirely.
    pub fn insert(&mut self, entity: Entity) -> InsertOutcome {
        let bucket = self.models.entry(entity.model_type.clone()).or_default();
        let Some(existing) = bucket.get_mut(&entity.key) else {
            bucket.insert(entity.key.clone(), entity);
            return InsertOutcome::Inserted;
        };

        if entity.meta.placeholder {
            return InsertOutcome::Kept;
        }
        if existing.meta.placeholder {
            *existing = entity;
            return InsertOutcome::Upgraded;
        }

        warn!("duplicate source record: {} {}", entity.model_type, entity.key);
        self.duplicates
            .entry(entity.model_type)
            .or_default()
            .insert(entity.key);
        InsertOutcome::Duplicate
    }

    /// Returns the indexed entity for these identifiers, indexing a
    /// placeholder built from `defaults` if none exists yet.
    pub fn get_or_create(
        &mut self,
        schema: &EntitySchema,
        identifiers: AttrMap,
        defaults: AttrMap,
    ) -> ModelResult<&Entity> {
        let key = Entity::key_for(schema, &identifiers)?;
        let bucket = self.models.entry(schema.model_type.clone()).or_default();
        if !bucket.contains_key(&key) {
            let placeholder = Entity::placeholder(schema, identifiers, defaults)?;
            bucket.insert(key.clone(), placeholder);
        }
        // Just ensured present.
        Ok(&bucket[&key])
    }

    pub fn get(&self, model_type: &str, key: &NaturalKey) -> Option<&Entity> {
        self.models.get(model_type).and_then(|m| m.get(key))
    }

    pub fn contains(&self, model_type: &str, key: &NaturalKey) -> bool {
        self.get(model_type, key).is_some()
    }

    /// Entities of one model type in natural-key order.
    pub fn all<'a>(&'a self, model_type: &str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.models
            .get(model_type)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Natural keys of one model type, in order.
    pub fn keys<'a>(&'a self, model_type: &str) -> impl Iterator<Item = &'a NaturalKey> + 'a {
        self.models
            .get(model_type)
            .into_iter()
            .flat_map(BTreeMap::keys)
    }

    pub fn is_duplicate(&self, model_type: &str, key: &NaturalKey) -> bool {
        self.duplicates
            .get(model_type)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Every (model type, key) that appeared more than once.
    pub fn duplicates(&self) -> impl Iterator<Item = (&str, &NaturalKey)> {
        self.duplicates
            .iter()
            .flat_map(|(m, keys)| keys.iter().map(move |k| (m.as_str(), k)))
    }

    pub fn model_len(&self, model_type: &str) -> usize {
        self.models.get(model_type).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.models.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough memory footprint of the indexed entities.
    pub fn estimated_size(&self) -> usize {
        self.models
            .values()
            .flat_map(BTreeMap::values)
            .map(Entity::estimated_size)
            .sum()
    }

    pub fn clear(&mut self) {
        self.models.clear();
        self.duplicates.clear();
    }
}
