//! The model registry.
//!
//! A static table mapping model-type name to its schema and optional
//! handler. The engines iterate the table generically; nothing dispatches on
//! concrete model types. The dependency order is computed once, when the
//! registry is built, and a cycle between two types is rejected there.

use crate::entity::AttrMap;
use crate::error::{ModelError, ModelResult};
use crate::handler::ModelHandler;
use crate::schema::{EntitySchema, FieldKind};
use reconcile_types::{Reference, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// A registered Entity Type.
#[derive(Clone)]
pub struct ModelEntry {
    pub schema: EntitySchema,
    pub handler: Option<Arc<dyn ModelHandler>>,
}

impl fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelEntry")
            .field("schema", &self.schema)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Collects schemas before validation.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<ModelEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model written by the generic engine.
    #[must_use]
    pub fn register(mut self, schema: EntitySchema) -> Self {
        self.entries.push(ModelEntry {
            schema,
            handler: None,
        });
        self
    }

    /// Registers a model with custom hooks.
    #[must_use]
    pub fn register_with_handler(
        mut self,
        schema: EntitySchema,
        handler: Arc<dyn ModelHandler>,
    ) -> Self {
        self.entries.push(ModelEntry {
            schema,
            handler: Some(handler),
        });
        self
    }

    /// Validates every schema and computes the dependency order.
    pub fn build(self) -> ModelResult<ModelRegistry> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            entry.schema.validate()?;
            if index
                .insert(entry.schema.model_type.clone(), i)
                .is_some()
            {
                return Err(ModelError::DuplicateModel(entry.schema.model_type.clone()));
            }
        }

        for entry in &self.entries {
            let schema = &entry.schema;
            for field in schema.identifiers.iter().chain(schema.attributes.iter()) {
                for target in field.kind.targets() {
                    if !index.contains_key(target) {
                        return Err(ModelError::UnknownModel {
                            model_type: schema.model_type.clone(),
                            field: field.name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        let order = topological_order(&self.entries, &index)?;
        let entries = self
            .entries
            .into_iter()
            .map(|e| (e.schema.model_type.clone(), e))
            .collect();
        Ok(ModelRegistry { entries, order })
    }
}

/// Kahn's algorithm over the cross-type reference graph. Ties resolve in
/// registration order so the result is deterministic. Self-references are
/// not edges: ordering inside one type is the diff engine's concern.
fn topological_order(
    entries: &[ModelEntry],
    index: &HashMap<String, usize>,
) -> ModelResult<Vec<String>> {
    let n = entries.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, entry) in entries.iter().enumerate() {
        for dep in entry.schema.dependencies() {
            let j = index[dep];
            if j != i {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        let mut next: Vec<usize> = Vec::new();
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                next.push(d);
            }
        }
        next.sort_unstable();
        ready.extend(next);
    }

    if order.len() < n {
        let placed: HashSet<usize> = order.iter().copied().collect();
        return Err(ModelError::CyclicDependency {
            cycle: find_cycle(entries, index, &placed),
        });
    }

    Ok(order
        .into_iter()
        .map(|i| entries[i].schema.model_type.clone())
        .collect())
}

/// Every unplaced node still has an unplaced dependency, so walking
/// dependencies from any of them must revisit a node.
fn find_cycle(
    entries: &[ModelEntry],
    index: &HashMap<String, usize>,
    placed: &HashSet<usize>,
) -> Vec<String> {
    let Some(start) = (0..entries.len()).find(|i| !placed.contains(i)) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = entries[current]
            .schema
            .dependencies()
            .into_iter()
            .map(|d| index[d])
            .find(|&j| j != current && !placed.contains(&j));
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| entries[i].schema.model_type.clone())
                .collect();
            cycle.push(entries[next].schema.model_type.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter()
        .map(|i| entries[i].schema.model_type.clone())
        .collect()
}

/// Validated Entity Types in dependency order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelEntry>,
    order: Vec<String>,
}

impl ModelRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Model types with dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, model_type: &str) -> Option<&ModelEntry> {
        self.entries.get(model_type)
    }

    pub fn schema(&self, model_type: &str) -> Option<&EntitySchema> {
        self.entries.get(model_type).map(|e| &e.schema)
    }

    /// Like [`schema`](Self::schema), but unknown types are an error.
    pub fn require(&self, model_type: &str) -> ModelResult<&EntitySchema> {
        self.schema(model_type)
            .ok_or_else(|| ModelError::NotRegistered(model_type.to_string()))
    }

    pub fn handler(&self, model_type: &str) -> Option<&Arc<dyn ModelHandler>> {
        self.entries.get(model_type).and_then(|e| e.handler.as_ref())
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.entries.contains_key(model_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schemas in dependency order.
    pub fn schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.order.iter().filter_map(|m| self.schema(m))
    }

    /// Rewrites reference-valued identifiers to the canonical key of the type
    /// they point at.
    ///
    /// A natural key that embeds a reference must use the referenced entity's
    /// canonical key: the backing store rebuilds the same part from the link,
    /// which only knows the canonical form. Adapters call this before
    /// deriving keys. References whose target type cannot be determined are
    /// left as they are.
    pub fn canonical_identifiers(&self, schema: &EntitySchema, mut identifiers: AttrMap) -> AttrMap {
        for field in &schema.identifiers {
            let Some(Value::Ref(r)) = identifiers.get(&field.name) else {
                continue;
            };
            let target = match &field.kind {
                FieldKind::ForeignKey { model } => Some(model.as_str()),
                FieldKind::Polymorphic { candidates, discriminator } => r
                    .content_type
                    .as_deref()
                    .or_else(|| identifiers.get(discriminator).and_then(Value::as_str))
                    .or(match candidates.as_slice() {
                        [only] => Some(only.as_str()),
                        _ => None,
                    }),
                _ => None,
            };
            let Some(target) = target.and_then(|t| self.schema(t)) else {
                continue;
            };
            let canonical = Value::Ref(Reference {
                key: target.normalize_key(&r.key),
                content_type: r.content_type.clone(),
            });
            identifiers.insert(field.name.clone(), canonical);
        }
        identifiers
    }
}
