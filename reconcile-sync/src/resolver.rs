//! Relationship resolution.
//!
//! Turns reference values (natural keys of other entities) into links to
//! backing-store rows. Lookups go through the per-run cache first (rows
//! written or removed during this run), then the target's loaded key table,
//! then a single store query whose result is cached.

use crate::cache::{CacheStats, LookupCache};
use crate::error::EntryError;
use reconcile_model::{AttrMap, EntitySchema, FieldDef, FieldKind, ModelRegistry};
use reconcile_store::{Datastore, Link, StoredValue};
use reconcile_types::{NaturalKey, RecordId, Reference, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Model type → natural key → row id, as loaded from the target.
pub type KeyTable = HashMap<String, HashMap<NaturalKey, RecordId>>;

/// Resolves references for one run.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<ModelRegistry>,
    keys: Arc<KeyTable>,
    cache: Arc<Mutex<LookupCache>>,
    store: Option<Arc<dyn Datastore>>,
}

impl Resolver {
    pub fn new(
        registry: Arc<ModelRegistry>,
        keys: Arc<KeyTable>,
        cache: Arc<Mutex<LookupCache>>,
        store: Option<Arc<dyn Datastore>>,
    ) -> Self {
        Self {
            registry,
            keys,
            cache,
            store,
        }
    }

    fn cache(&self) -> MutexGuard<'_, LookupCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Canonical form of a key pointing at `model_type`.
    fn canonical_key(&self, model_type: &str, key: &NaturalKey) -> NaturalKey {
        match self.registry.schema(model_type) {
            Some(schema) => schema.normalize_key(key),
            None => key.clone(),
        }
    }

    fn known(&self, cache: &mut LookupCache, model_type: &str, key: &NaturalKey) -> Option<Option<RecordId>> {
        if let Some(hit) = cache.get(model_type, key) {
            return Some(hit);
        }
        let id = self.keys.get(model_type).and_then(|m| m.get(key))?;
        cache.count_index_hit();
        Some(Some(*id))
    }

    /// Finds the row for (model type, natural key).
    pub fn lookup(&self, model_type: &str, key: &NaturalKey) -> Result<Option<RecordId>, EntryError> {
        let key = self.canonical_key(model_type, key);
        let mut cache = self.cache();
        if let Some(hit) = self.known(&mut cache, model_type, &key) {
            return Ok(hit);
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        debug!("cache miss for {model_type} {key}, querying store");
        let found = store.find_by_key(model_type, &key)?.map(|row| row.id);
        cache.record_query(model_type, key, found);
        Ok(found)
    }

    /// Like [`lookup`](Self::lookup) without the store fallback: only rows
    /// present at load time or written during this run are found.
    pub fn lookup_loaded(&self, model_type: &str, key: &NaturalKey) -> Option<RecordId> {
        let key = self.canonical_key(model_type, key);
        let mut cache = self.cache();
        self.known(&mut cache, model_type, &key).flatten()
    }

    /// Records a row created during this run.
    pub fn register(&self, model_type: &str, key: NaturalKey, id: RecordId) {
        self.cache().register(model_type, key, id);
    }

    /// Records a row removed during this run.
    pub fn forget(&self, model_type: &str, key: &NaturalKey) {
        self.cache().forget(model_type, key);
    }

    /// Undoes `register`/`forget` for a write that was rolled back.
    pub fn evict(&self, model_type: &str, key: &NaturalKey) {
        self.cache().evict(model_type, key);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache().stats()
    }

    /// Resolves one field value into its stored form.
    ///
    /// `fields` supplies sibling values, from which a polymorphic field's
    /// discriminator is read. Scalars pass through unchanged.
    pub fn resolve_field(
        &self,
        field: &FieldDef,
        value: &Value,
        fields: &AttrMap,
    ) -> Result<StoredValue, EntryError> {
        match &field.kind {
            FieldKind::Scalar | FieldKind::ScalarSet => Ok(StoredValue::Plain(value.clone())),
            FieldKind::ForeignKey { model } => match value {
                Value::Null => Ok(StoredValue::Plain(Value::Null)),
                _ => {
                    let reference = expect_reference(field, value)?;
                    self.resolve_one(field, model, reference).map(StoredValue::Link)
                }
            },
            FieldKind::ManyToMany { model, .. } => {
                let items: &[Value] = match value {
                    Value::Null => &[],
                    Value::List(items) => items,
                    other => std::slice::from_ref(other),
                };
                // All or nothing: one unresolved member fails the field.
                let links = items
                    .iter()
                    .map(|item| {
                        let reference = expect_reference(field, item)?;
                        self.resolve_one(field, model, reference)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StoredValue::Links(links))
            }
            FieldKind::Polymorphic {
                candidates,
                discriminator,
            } => match value {
                Value::Null => Ok(StoredValue::Plain(Value::Null)),
                _ => {
                    let reference = expect_reference(field, value)?;
                    let declared = fields.get(discriminator).and_then(Value::as_str);
                    let model = self.pick_candidate(field, candidates, reference, declared)?;
                    self.resolve_one(field, &model, reference).map(StoredValue::Link)
                }
            },
        }
    }

    /// Resolves every relationship field in `fields`.
    pub fn resolve_all(
        &self,
        schema: &EntitySchema,
        fields: &AttrMap,
    ) -> Result<reconcile_store::FieldMap, EntryError> {
        fields
            .iter()
            .map(|(name, value)| {
                let stored = match schema.field(name) {
                    Some(def) => self.resolve_field(def, value, fields)?,
                    None => StoredValue::Plain(value.clone()),
                };
                Ok((name.clone(), stored))
            })
            .collect()
    }

    /// Chooses the concrete type behind a polymorphic reference.
    ///
    /// The discriminator is the reference's own content type, else the
    /// entity's declared discriminator attribute. Without either, candidates
    /// are narrowed by key arity; more than one survivor is ambiguous.
    pub fn pick_candidate(
        &self,
        field: &FieldDef,
        candidates: &[String],
        reference: &Reference,
        declared: Option<&str>,
    ) -> Result<String, EntryError> {
        if let Some(ct) = reference.content_type.as_deref().or(declared) {
            if candidates.iter().any(|c| c == ct) {
                return Ok(ct.to_string());
            }
            return Err(EntryError::UnresolvedReference {
                field: field.name.clone(),
                target: format!("{ct}:{} (not a candidate type)", reference.key),
            });
        }

        let arity = reference.key.arity();
        let fitting: Vec<&String> = candidates
            .iter()
            .filter(|c| {
                self.registry
                    .schema(c)
                    .is_some_and(|s| s.identifiers.len() == arity)
            })
            .collect();
        match fitting.as_slice() {
            [] => Err(EntryError::UnresolvedReference {
                field: field.name.clone(),
                target: reference.key.to_string(),
            }),
            [only] => Ok((*only).clone()),
            many => Err(EntryError::AmbiguousReference {
                field: field.name.clone(),
                key: reference.key.to_string(),
                candidates: many.iter().map(|c| (*c).clone()).collect(),
            }),
        }
    }

    fn resolve_one(
        &self,
        field: &FieldDef,
        model_type: &str,
        reference: &Reference,
    ) -> Result<Link, EntryError> {
        match self.lookup(model_type, &reference.key)? {
            Some(id) => Ok(Link::new(model_type, id)),
            None => Err(EntryError::UnresolvedReference {
                field: field.name.clone(),
                target: format!("{model_type} {}", reference.key),
            }),
        }
    }
}

fn expect_reference<'a>(field: &FieldDef, value: &'a Value) -> Result<&'a Reference, EntryError> {
    value
        .as_reference()
        .ok_or_else(|| EntryError::UnresolvedReference {
            field: field.name.clone(),
            target: format!("{value} (not a reference)"),
        })
}
