//! Target-side adapter over a [`Datastore`].
//!
//! Loads every registered model type with one bulk `list` call, then
//! rewrites row links as natural-key references through an in-memory
//! id → key table. Load cost is linear in the number of rows; nothing is
//! fetched per relationship.

use crate::adapter::{Adapter, LoadContext};
use crate::cache::{CacheStats, LookupCache};
use crate::engine::SyncConfig;
use crate::error::LoadError;
use crate::index::EntityIndex;
use crate::resolver::{KeyTable, Resolver};
use async_trait::async_trait;
use reconcile_model::{AttrMap, Entity, EntitySchema, FieldKind, ModelRegistry};
use reconcile_store::{Datastore, Link, Row, StoredValue};
use reconcile_types::{NaturalKey, RecordId, Reference, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub struct DatastoreAdapter {
    name: String,
    store: Arc<dyn Datastore>,
    config: SyncConfig,
    index: EntityIndex,
    keys: Arc<KeyTable>,
    cache: Arc<Mutex<LookupCache>>,
}

impl DatastoreAdapter {
    pub fn new(name: impl Into<String>, store: Arc<dyn Datastore>, config: SyncConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            index: EntityIndex::new(),
            keys: Arc::new(KeyTable::new()),
            cache: Arc::new(Mutex::new(LookupCache::new())),
        }
    }

    /// A resolver over this adapter's key table and cache.
    ///
    /// Only meaningful after `load`; before it every lookup goes to the store.
    pub fn resolver(&self, registry: Arc<ModelRegistry>) -> Resolver {
        Resolver::new(
            registry,
            Arc::clone(&self.keys),
            Arc::clone(&self.cache),
            Some(Arc::clone(&self.store)),
        )
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    /// Ends the run: drops cached lookups so nothing leaks into the next one.
    pub fn invalidate_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }

    fn is_soft_deleted(&self, row: &Row) -> bool {
        row.status.as_deref() == Some(self.config.soft_delete_status.as_str())
            && row.tags.contains(&self.config.soft_delete_tag)
    }

    fn row_to_entity(
        &self,
        schema: &EntitySchema,
        row: &Row,
        ids: &HashMap<RecordId, (&str, &NaturalKey)>,
    ) -> Result<Entity, LoadError> {
        let mut identifiers = AttrMap::new();
        let mut attributes = AttrMap::new();
        for (name, stored) in &row.fields {
            // Columns the schema no longer declares are not reconciled.
            let Some(field) = schema.field(name) else {
                continue;
            };
            let value = match stored {
                StoredValue::Plain(v) => v.clone(),
                StoredValue::Link(link) => {
                    let polymorphic = matches!(field.kind, FieldKind::Polymorphic { .. });
                    Value::Ref(self.link_to_reference(link, polymorphic, ids)?)
                }
                StoredValue::Links(links) => Value::List(
                    links
                        .iter()
                        .map(|l| self.link_to_reference(l, false, ids).map(Value::Ref))
                        .collect::<Result<_, _>>()?,
                ),
            };
            if schema.is_identifier(name) {
                identifiers.insert(name.clone(), value);
            } else {
                attributes.insert(name.clone(), value);
            }
        }

        let mut entity = Entity::build(schema, identifiers, attributes)?;
        entity.meta.record_id = Some(row.id);
        entity.meta.owner = row.owner.clone();
        entity.meta.soft_deleted = self.is_soft_deleted(row);
        Ok(entity)
    }

    fn link_to_reference(
        &self,
        link: &Link,
        typed: bool,
        ids: &HashMap<RecordId, (&str, &NaturalKey)>,
    ) -> Result<Reference, LoadError> {
        let Some((model_type, key)) = ids.get(&link.id) else {
            return Err(LoadError::malformed(
                &self.name,
                format!("link to unknown {} row {}", link.model_type, link.id),
            ));
        };
        Ok(if typed {
            Reference::typed(*model_type, (*key).clone())
        } else {
            Reference::to((*key).clone())
        })
    }
}

#[async_trait]
impl Adapter for DatastoreAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&mut self, ctx: &LoadContext) -> Result<(), LoadError> {
        self.index.clear();

        let store = Arc::clone(&self.store);
        let model_types = ctx.registry.order().to_vec();
        let rows = tokio::task::spawn_blocking(move || store.list(&model_types))
            .await
            .map_err(|e| LoadError::unavailable(&self.name, format!("load task failed: {e}")))??;
        debug!("{}: fetched {} rows", self.name, rows.len());

        // Every row goes into the id table, including rows the scope or
        // ownership filter drops, so links to them still translate.
        let ids: HashMap<RecordId, (&str, &NaturalKey)> = rows
            .iter()
            .map(|r| (r.id, (r.model_type.as_str(), &r.key)))
            .collect();
        let mut keys = KeyTable::new();
        for row in &rows {
            keys.entry(row.model_type.clone())
                .or_default()
                .insert(row.key.clone(), row.id);
        }

        for row in &rows {
            if ctx.cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            if !ctx.in_scope(&row.model_type, &row.key) {
                continue;
            }
            if let Some(source) = &ctx.owned_by {
                if !row.owner.as_ref().is_some_and(|o| o.is_owned_by(source)) {
                    continue;
                }
            }
            let Some(schema) = ctx.registry.schema(&row.model_type) else {
                continue;
            };
            let entity = self.row_to_entity(schema, row, &ids)?;
            self.index.insert(entity);
        }

        self.keys = Arc::new(keys);
        self.cache = Arc::new(Mutex::new(LookupCache::new()));
        info!("Loaded {} entities from {}", self.index.len(), self.name);
        Ok(())
    }

    fn index(&self) -> &EntityIndex {
        &self.index
    }
}
