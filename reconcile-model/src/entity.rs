use crate::error::{ModelError, ModelResult};
use crate::normalize::normalize_value;
use crate::ownership::OwnershipMarker;
use crate::schema::{EntitySchema, FieldKind};
use reconcile_types::{NaturalKey, RecordId, Reference, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field name → value, ordered by name.
pub type AttrMap = BTreeMap<String, Value>;

/// One Entity Instance as loaded by an adapter.
///
/// Instances are rebuilt on every load and discarded after the run; the
/// backing store is the durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub model_type: String,
    pub key: NaturalKey,
    pub identifiers: AttrMap,
    pub attributes: AttrMap,
    #[serde(default)]
    pub meta: EntityMeta,
}

/// Side-specific bookkeeping that is not reconciled as data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Backing-store row, when loaded from a datastore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnershipMarker>,
    /// Row currently carries the safe-delete status and tag.
    #[serde(default)]
    pub soft_deleted: bool,
    /// Created by `get_or_create` and not yet confirmed by a full record.
    #[serde(default)]
    pub placeholder: bool,
}

impl Entity {
    /// Builds an instance, validating its fields against `schema`.
    ///
    /// Attributes the caller leaves out are set to null, so every instance of
    /// a type carries the same attribute set.
    pub fn build(
        schema: &EntitySchema,
        identifiers: AttrMap,
        mut attributes: AttrMap,
    ) -> ModelResult<Self> {
        for name in identifiers.keys() {
            if !schema.is_identifier(name) {
                return Err(ModelError::UnknownField {
                    model_type: schema.model_type.clone(),
                    field: name.clone(),
                });
            }
        }
        for name in attributes.keys() {
            if schema.attribute_def(name).is_none() {
                return Err(ModelError::UnknownField {
                    model_type: schema.model_type.clone(),
                    field: name.clone(),
                });
            }
        }
        let key = Self::key_for(schema, &identifiers)?;
        for name in schema.attribute_names() {
            attributes.entry(name.to_string()).or_insert(Value::Null);
        }
        Ok(Self {
            model_type: schema.model_type.clone(),
            key,
            identifiers,
            attributes,
            meta: EntityMeta::default(),
        })
    }

    /// Builds a placeholder for an entity seen only through a related record.
    ///
    /// Unlike [`build`](Self::build), attributes are not padded with nulls: a
    /// placeholder only asserts the values it was given.
    pub fn placeholder(
        schema: &EntitySchema,
        identifiers: AttrMap,
        defaults: AttrMap,
    ) -> ModelResult<Self> {
        let supplied: Vec<String> = defaults.keys().cloned().collect();
        let mut entity = Self::build(schema, identifiers, defaults)?;
        entity.attributes.retain(|name, _| supplied.contains(name));
        entity.meta.placeholder = true;
        Ok(entity)
    }

    /// Derives the natural key from identifier values in schema order.
    ///
    /// Identifier normalization rules apply, so "Core" and "core" address the
    /// same entity when the field is lowercased. Reference-valued identifiers
    /// are expected in canonical form; see
    /// [`ModelRegistry::canonical_identifiers`](crate::ModelRegistry::canonical_identifiers).
    pub fn key_for(schema: &EntitySchema, identifiers: &AttrMap) -> ModelResult<NaturalKey> {
        let mut parts = Vec::with_capacity(schema.identifiers.len());
        for field in &schema.identifiers {
            let part = identifiers
                .get(&field.name)
                .map(|v| normalize_value(v, &field.normalize))
                .and_then(|v| v.key_part())
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ModelError::MissingIdentifier {
                    model_type: schema.model_type.clone(),
                    field: field.name.clone(),
                })?;
            parts.push(part);
        }
        Ok(NaturalKey::new(parts))
    }

    /// Looks up a field among identifiers, then attributes.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.identifiers
            .get(name)
            .or_else(|| self.attributes.get(name))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_reference(&self, name: &str) -> Option<&Reference> {
        self.get(name).and_then(Value::as_reference)
    }

    /// Content type behind a polymorphic field: the reference's own
    /// discriminator, else the entity's declared discriminator attribute.
    pub fn discriminator(&self, schema: &EntitySchema, field: &str) -> Option<String> {
        if let Some(ct) = self.get_reference(field).and_then(|r| r.content_type.clone()) {
            return Some(ct);
        }
        match schema.field(field).map(|f| &f.kind) {
            Some(FieldKind::Polymorphic { discriminator, .. }) => {
                self.get_str(discriminator).map(str::to_string)
            }
            _ => None,
        }
    }

    /// Identifiers and attributes in one map.
    pub fn all_fields(&self) -> AttrMap {
        self.identifiers
            .iter()
            .chain(self.attributes.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Rough in-memory footprint, used for load statistics.
    pub fn estimated_size(&self) -> usize {
        let fields: usize = self
            .identifiers
            .iter()
            .chain(self.attributes.iter())
            .map(|(k, v)| k.len() + v.estimated_size())
            .sum();
        std::mem::size_of::<Self>() + self.model_type.len() + fields
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.model_type, self.key)
    }
}
