use crate::error::{ModelError, ModelResult};
use crate::normalize::{Normalization, normalize_value};
use reconcile_types::{NaturalKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Describes one Entity Type: how its instances are keyed and which
/// attributes the engine reconciles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Model-type name, unique within a registry.
    pub model_type: String,
    /// Identifier fields in key order. Together they form the natural key.
    pub identifiers: Vec<FieldDef>,
    /// Every other reconciled field, including relationship references.
    #[serde(default)]
    pub attributes: Vec<FieldDef>,
    /// Whether a soft-deleted instance is restored automatically when the
    /// source reports it again.
    #[serde(default = "default_auto_recover")]
    pub auto_recover: bool,
}

fn default_auto_recover() -> bool {
    true
}

impl EntitySchema {
    /// Starts a schema with no fields.
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            identifiers: Vec::new(),
            attributes: Vec::new(),
            auto_recover: true,
        }
    }

    /// Appends an identifier field.
    #[must_use]
    pub fn identifier(mut self, field: FieldDef) -> Self {
        self.identifiers.push(field);
        self
    }

    /// Appends an attribute field.
    #[must_use]
    pub fn attribute(mut self, field: FieldDef) -> Self {
        self.attributes.push(field);
        self
    }

    /// Sets the safe-delete auto-recovery flag.
    #[must_use]
    pub fn auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Looks up a field by name among identifiers and attributes.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.identifiers
            .iter()
            .chain(self.attributes.iter())
            .find(|f| f.name == name)
    }

    /// Looks up an attribute (non-identifier) field by name.
    pub fn attribute_def(&self, name: &str) -> Option<&FieldDef> {
        self.attributes.iter().find(|f| f.name == name)
    }

    pub fn is_identifier(&self, name: &str) -> bool {
        self.identifiers.iter().any(|f| f.name == name)
    }

    pub fn identifier_names(&self) -> impl Iterator<Item = &str> {
        self.identifiers.iter().map(|f| f.name.as_str())
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|f| f.name.as_str())
    }

    /// Model types this type references through any relationship field,
    /// itself included when it is self-referencing.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.identifiers
            .iter()
            .chain(self.attributes.iter())
            .flat_map(|f| f.kind.targets())
            .collect()
    }

    /// Whether any field references this same model type.
    pub fn is_self_referencing(&self) -> bool {
        self.dependencies().contains(self.model_type.as_str())
    }

    /// Canonical form of a key that references this type: each part is
    /// normalized by the matching identifier's rules. A key of the wrong
    /// arity is returned unchanged.
    pub fn normalize_key(&self, key: &NaturalKey) -> NaturalKey {
        if key.arity() != self.identifiers.len() {
            return key.clone();
        }
        NaturalKey::new(key.parts().iter().zip(&self.identifiers).map(|(part, field)| {
            match normalize_value(&Value::Text(part.clone()), &field.normalize) {
                Value::Text(s) => s,
                _ => part.clone(),
            }
        }))
    }

    /// Checks the schema's internal consistency.
    pub fn validate(&self) -> ModelResult<()> {
        let invalid = |reason: String| ModelError::InvalidSchema {
            model_type: self.model_type.clone(),
            reason,
        };

        if self.model_type.trim().is_empty() {
            return Err(invalid("empty model type name".into()));
        }
        if self.identifiers.is_empty() {
            return Err(invalid("at least one identifier field is required".into()));
        }

        let mut seen = HashSet::new();
        for field in self.identifiers.iter().chain(self.attributes.iter()) {
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!(
                    "field {} declared more than once (identifier and attribute fields must not overlap)",
                    field.name
                )));
            }
        }

        for field in &self.identifiers {
            if !matches!(field.kind, FieldKind::Scalar | FieldKind::ForeignKey { .. }) {
                return Err(invalid(format!(
                    "identifier {} must be a scalar or foreign key",
                    field.name
                )));
            }
        }

        for field in &self.attributes {
            if let FieldKind::Polymorphic {
                candidates,
                discriminator,
            } = &field.kind
            {
                if candidates.is_empty() {
                    return Err(invalid(format!(
                        "polymorphic field {} has no candidate model types",
                        field.name
                    )));
                }
                match self.attribute_def(discriminator) {
                    Some(d) if d.kind == FieldKind::Scalar => {}
                    _ => {
                        return Err(invalid(format!(
                            "polymorphic field {} needs scalar discriminator attribute {}",
                            field.name, discriminator
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// One identifier or attribute field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// Rules applied before comparing values of this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normalize: Vec<Normalization>,
    /// Discovery sources keep authority over this field when another source
    /// owns the entity.
    #[serde(default)]
    pub discovery_precedence: bool,
}

impl FieldDef {
    fn with_kind(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            normalize: Vec::new(),
            discovery_precedence: false,
        }
    }

    /// A plain value. Lists are compared in order.
    pub fn scalar(name: &str) -> Self {
        Self::with_kind(name, FieldKind::Scalar)
    }

    /// A list of scalars compared as a set.
    pub fn scalar_set(name: &str) -> Self {
        Self::with_kind(name, FieldKind::ScalarSet)
    }

    /// A reference to one entity of `model`.
    pub fn foreign_key(name: &str, model: &str) -> Self {
        Self::with_kind(name, FieldKind::ForeignKey { model: model.into() })
    }

    /// An unordered collection of references to `model`.
    pub fn many_to_many(name: &str, model: &str) -> Self {
        Self::with_kind(
            name,
            FieldKind::ManyToMany {
                model: model.into(),
                ordered: false,
            },
        )
    }

    /// An ordered collection of references to `model`.
    pub fn ordered_many_to_many(name: &str, model: &str) -> Self {
        Self::with_kind(
            name,
            FieldKind::ManyToMany {
                model: model.into(),
                ordered: true,
            },
        )
    }

    /// A reference whose target type is chosen by `discriminator`.
    pub fn polymorphic(name: &str, candidates: &[&str], discriminator: &str) -> Self {
        Self::with_kind(
            name,
            FieldKind::Polymorphic {
                candidates: candidates.iter().map(|c| (*c).to_string()).collect(),
                discriminator: discriminator.into(),
            },
        )
    }

    /// Adds a normalization rule.
    #[must_use]
    pub fn normalized(mut self, rule: Normalization) -> Self {
        self.normalize.push(rule);
        self
    }

    /// Marks the field as owned by discovery sources.
    #[must_use]
    pub fn discovery_precedence(mut self) -> Self {
        self.discovery_precedence = true;
        self
    }

    pub fn is_relationship(&self) -> bool {
        self.kind.is_relationship()
    }
}

/// How a field's value is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Scalar,
    ScalarSet,
    ForeignKey {
        model: String,
    },
    ManyToMany {
        model: String,
        #[serde(default)]
        ordered: bool,
    },
    Polymorphic {
        candidates: Vec<String>,
        discriminator: String,
    },
}

impl FieldKind {
    pub fn is_relationship(&self) -> bool {
        !matches!(self, Self::Scalar | Self::ScalarSet)
    }

    /// Whether list values compare as sets.
    pub fn is_unordered(&self) -> bool {
        matches!(
            self,
            Self::ScalarSet | Self::ManyToMany { ordered: false, .. }
        )
    }

    /// Model types this field may point at.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Scalar | Self::ScalarSet => Vec::new(),
            Self::ForeignKey { model } | Self::ManyToMany { model, .. } => vec![model.as_str()],
            Self::Polymorphic { candidates, .. } => {
                candidates.iter().map(String::as_str).collect()
            }
        }
    }
}
