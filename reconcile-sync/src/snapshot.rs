//! JSON snapshot adapter.
//!
//! Loads entities from a serde document keyed by model type:
//!
//! ```json
//! {
//!   "interface": [
//!     {
//!       "identifiers": { "device": "router1", "name": "eth0" },
//!       "attributes": { "enabled": true },
//!       "embedded": { "device": [ { "identifiers": { "name": "router1" } } ] }
//!     }
//!   ]
//! }
//! ```
//!
//! `embedded` holds related records that arrived with this one (the rows of
//! a joined query). They go through `get_or_create`, so an interface may be
//! read before its device and the device's own full record, when it comes,
//! upgrades the placeholder.
//!
//! Relationship fields may be written as plain strings; they are read as
//! natural keys.

use crate::adapter::{Adapter, LoadContext};
use crate::error::LoadError;
use crate::index::{EntityIndex, InsertOutcome};
use async_trait::async_trait;
use reconcile_model::{AttrMap, Entity, EntitySchema, FieldKind, ModelRegistry};
use reconcile_types::{NaturalKey, Reference, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// One record in a snapshot document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub identifiers: AttrMap,
    #[serde(default)]
    pub attributes: AttrMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub embedded: BTreeMap<String, Vec<SnapshotRecord>>,
}

impl SnapshotRecord {
    pub fn new(identifiers: AttrMap) -> Self {
        Self {
            identifiers,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn identifier(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.identifiers.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn embed(mut self, model_type: &str, record: SnapshotRecord) -> Self {
        self.embedded
            .entry(model_type.to_string())
            .or_default()
            .push(record);
        self
    }
}

/// Model type → records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotDocument(pub BTreeMap<String, Vec<SnapshotRecord>>);

impl SnapshotDocument {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn record(mut self, model_type: &str, record: SnapshotRecord) -> Self {
        self.push(model_type, record);
        self
    }

    pub fn push(&mut self, model_type: &str, record: SnapshotRecord) {
        self.0.entry(model_type.to_string()).or_default().push(record);
    }

    /// Removes every record of `model_type` matching `pred`.
    pub fn remove(&mut self, model_type: &str, pred: impl Fn(&SnapshotRecord) -> bool) {
        if let Some(records) = self.0.get_mut(model_type) {
            records.retain(|r| !pred(r));
        }
    }

    pub fn records_mut(&mut self, model_type: &str) -> impl Iterator<Item = &mut SnapshotRecord> {
        self.0.get_mut(model_type).into_iter().flatten()
    }
}

#[derive(Debug, Clone)]
enum Origin {
    Document(SnapshotDocument),
    File(PathBuf),
}

/// Adapter over a [`SnapshotDocument`], in memory or in a JSON file.
#[derive(Debug)]
pub struct SnapshotAdapter {
    name: String,
    origin: Origin,
    index: EntityIndex,
}

impl SnapshotAdapter {
    pub fn new(name: impl Into<String>, document: SnapshotDocument) -> Self {
        Self {
            name: name.into(),
            origin: Origin::Document(document),
            index: EntityIndex::new(),
        }
    }

    /// Parses a document now; the adapter still has to be loaded.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, LoadError> {
        let document: SnapshotDocument = serde_json::from_str(json)?;
        Ok(Self::new(name, document))
    }

    /// Reads the file at load time.
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            origin: Origin::File(path.into()),
            index: EntityIndex::new(),
        }
    }

    /// Replaces the document; the next load sees the new content.
    pub fn set_document(&mut self, document: SnapshotDocument) {
        self.origin = Origin::Document(document);
    }

    async fn read_document(&self) -> Result<SnapshotDocument, LoadError> {
        match &self.origin {
            Origin::Document(doc) => Ok(doc.clone()),
            Origin::File(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    LoadError::unavailable(&self.name, format!("{}: {e}", path.display()))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    LoadError::malformed(&self.name, format!("{}: {e}", path.display()))
                })
            }
        }
    }

    fn load_record(
        &mut self,
        ctx: &LoadContext,
        model_type: &str,
        record: SnapshotRecord,
        embedded: bool,
    ) -> Result<(), LoadError> {
        let schema = schema_for(&ctx.registry, &self.name, model_type)?;
        let identifiers = ctx
            .registry
            .canonical_identifiers(schema, coerce_references(schema, record.identifiers));
        let attributes = coerce_references(schema, record.attributes);

        for (related_type, related) in record.embedded {
            for rec in related {
                self.load_record(ctx, &related_type, rec, true)?;
            }
        }

        let key = Entity::key_for(schema, &identifiers)?;
        if !ctx.in_scope(model_type, &key) {
            return Ok(());
        }

        if embedded {
            self.index.get_or_create(schema, identifiers, attributes)?;
            return Ok(());
        }
        let entity = Entity::build(schema, identifiers, attributes)?;
        if self.index.insert(entity) == InsertOutcome::Upgraded {
            debug!("{model_type} {key}: placeholder upgraded by full record");
        }
        Ok(())
    }
}

fn schema_for<'a>(
    registry: &'a ModelRegistry,
    adapter: &str,
    model_type: &str,
) -> Result<&'a EntitySchema, LoadError> {
    registry
        .schema(model_type)
        .ok_or_else(|| LoadError::malformed(adapter, format!("unknown model type {model_type}")))
}

/// Reads plain strings in relationship fields as natural-key references.
fn coerce_references(schema: &EntitySchema, mut values: AttrMap) -> AttrMap {
    for (name, value) in &mut values {
        let Some(field) = schema.field(name) else {
            continue;
        };
        let replacement = match (&field.kind, &*value) {
            (FieldKind::ForeignKey { .. } | FieldKind::Polymorphic { .. }, Value::Text(s)) => {
                Some(Value::Ref(Reference::to(text_key(s))))
            }
            (FieldKind::ManyToMany { .. }, Value::List(items)) => Some(Value::List(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Text(s) => Value::Ref(Reference::to(text_key(s))),
                        other => other.clone(),
                    })
                    .collect(),
            )),
            _ => None,
        };
        if let Some(replacement) = replacement {
            *value = replacement;
        }
    }
    values
}

fn text_key(s: &str) -> NaturalKey {
    NaturalKey::parse(s).unwrap_or_else(|_| NaturalKey::single(s))
}

#[async_trait]
impl Adapter for SnapshotAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&mut self, ctx: &LoadContext) -> Result<(), LoadError> {
        self.index.clear();
        let document = self.read_document().await?;

        let mut by_type = document.0;
        if let Some(unknown) = by_type.keys().find(|m| !ctx.registry.contains(m)) {
            return Err(LoadError::malformed(
                &self.name,
                format!("unknown model type {unknown}"),
            ));
        }

        // Registry order keeps placeholder upgrades deterministic.
        for model_type in ctx.registry.order() {
            if ctx.cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            for record in by_type.remove(model_type).unwrap_or_default() {
                self.load_record(ctx, model_type, record, false)?;
            }
        }

        info!(
            "Loaded {} entities from {} ({} duplicate keys)",
            self.index.len(),
            self.name,
            self.index.duplicates().count()
        );
        Ok(())
    }

    fn index(&self) -> &EntityIndex {
        &self.index
    }
}
