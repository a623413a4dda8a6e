//! Diff engine.
//!
//! Compares two loaded snapshots model type by model type, in the registry's
//! dependency order, and emits a [`Changeset`]:
//!
//! 1. keys only in the source become Creates,
//! 2. keys on both sides whose canonical attribute values differ become
//!    Updates carrying just the changed fields,
//! 3. keys only in the target become Deletes.
//!
//! Values are compared in canonical form (normalization rules applied,
//! unordered collections sorted), so re-running against an unchanged source
//! yields an empty changeset.

use crate::changeset::{Changeset, ChangesetEntry, SyncWarning, WarningKind};
use crate::index::EntityIndex;
use reconcile_model::{AttrMap, Entity, EntitySchema, FieldDef, FieldKind, ModelRegistry, canonicalize};
use reconcile_types::{NaturalKey, Reference, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

/// Knobs for one diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Emit no Creates.
    pub skip_unmatched_source: bool,
    /// Emit no Deletes.
    pub skip_unmatched_target: bool,
    /// Emit no Deletes for targets that are already soft-deleted.
    pub skip_soft_deleted_targets: bool,
    /// Mark matches against unowned datastore rows as claims.
    pub claim_unowned: bool,
}

pub struct DiffEngine<'a> {
    registry: &'a ModelRegistry,
    options: DiffOptions,
}

impl<'a> DiffEngine<'a> {
    pub fn new(registry: &'a ModelRegistry, options: DiffOptions) -> Self {
        Self { registry, options }
    }

    /// Diffs `source` against `target` over every registered model type.
    pub fn diff(&self, source: &EntityIndex, target: &EntityIndex) -> Changeset {
        let mut changeset = Changeset::new();
        for schema in self.registry.schemas() {
            self.diff_model(schema, source, target, &mut changeset);
        }
        let summary = changeset.summary();
        info!(
            "Diff complete: {} create, {} update, {} delete, {} unchanged",
            summary.create, summary.update, summary.delete, summary.no_change
        );
        changeset
    }

    fn diff_model(
        &self,
        schema: &EntitySchema,
        source: &EntityIndex,
        target: &EntityIndex,
        changeset: &mut Changeset,
    ) {
        let model_type = schema.model_type.as_str();

        let duplicates: BTreeSet<&NaturalKey> = source
            .keys(model_type)
            .filter(|k| source.is_duplicate(model_type, k))
            .collect();
        for key in &duplicates {
            changeset.warn(SyncWarning {
                kind: WarningKind::DuplicateSourceRecord,
                model_type: model_type.to_string(),
                key: (*key).clone(),
                message: "source holds more than one record for this key; both excluded".into(),
            });
        }

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for src in source.all(model_type) {
            if duplicates.contains(&src.key) {
                continue;
            }
            match target.get(model_type, &src.key) {
                None => {
                    if !self.options.skip_unmatched_source {
                        creates.push(ChangesetEntry::create(src));
                    }
                }
                Some(dst) => match self.compare(schema, src, dst, changeset) {
                    Some(entry) => updates.push(entry),
                    None => changeset.count_unchanged(),
                },
            }
        }

        if !self.options.skip_unmatched_target {
            for dst in target.all(model_type) {
                if duplicates.contains(&dst.key) || source.contains(model_type, &dst.key) {
                    continue;
                }
                if dst.meta.soft_deleted && self.options.skip_soft_deleted_targets {
                    continue;
                }
                deletes.push(ChangesetEntry::delete(dst));
            }
        }

        if schema.is_self_referencing() {
            creates = order_self_references(schema, creates);
            // Referrers go first so their parents are unreferenced when removed.
            deletes = order_self_references(schema, deletes);
            deletes.reverse();
        }

        if !(creates.is_empty() && updates.is_empty() && deletes.is_empty()) {
            debug!(
                "{model_type}: {} create, {} update, {} delete",
                creates.len(),
                updates.len(),
                deletes.len()
            );
        }
        for entry in creates.into_iter().chain(updates).chain(deletes) {
            changeset.push(entry);
        }
    }

    /// Builds the Update for a matched pair, or `None` when nothing differs.
    fn compare(
        &self,
        schema: &EntitySchema,
        src: &Entity,
        dst: &Entity,
        changeset: &mut Changeset,
    ) -> Option<ChangesetEntry> {
        let mut old = AttrMap::new();
        let mut new = AttrMap::new();

        for field in &schema.attributes {
            // A placeholder only asserts the attributes it was given.
            let Some(src_value) = src.attributes.get(&field.name) else {
                continue;
            };
            let dst_value = dst.attributes.get(&field.name).unwrap_or(&Value::Null);
            if self.comparable(schema, field, src, src_value) == self.comparable(schema, field, dst, dst_value) {
                continue;
            }
            old.insert(field.name.clone(), dst_value.clone());
            new.insert(field.name.clone(), src_value.clone());
            if let FieldKind::Polymorphic { discriminator, .. } = &field.kind {
                // The resolver needs the discriminator next to the reference.
                if let Some(d) = src.attributes.get(discriminator) {
                    new.entry(discriminator.clone()).or_insert_with(|| d.clone());
                    old.entry(discriminator.clone())
                        .or_insert_with(|| dst.attributes.get(discriminator).cloned().unwrap_or_default());
                }
            }
        }

        let claim = self.options.claim_unowned
            && dst.meta.record_id.is_some()
            && dst.meta.owner.is_none();
        let mut recover = false;
        if dst.meta.soft_deleted {
            if schema.auto_recover {
                recover = true;
            } else {
                changeset.warn(SyncWarning {
                    kind: WarningKind::RecoveryDisabled,
                    model_type: schema.model_type.clone(),
                    key: dst.key.clone(),
                    message: "re-observed soft-deleted entity; restore it manually".into(),
                });
            }
        }

        if new.is_empty() && !claim && !recover {
            return None;
        }
        let mut entry = ChangesetEntry::update(dst, old, new);
        entry.claim = claim;
        entry.recover = recover;
        Some(entry)
    }

    /// The value of `field` as compared: canonicalized, with references
    /// reduced to the canonical key of their target type.
    fn comparable(&self, schema: &EntitySchema, field: &FieldDef, entity: &Entity, value: &Value) -> Value {
        let canonical = canonicalize(field, value);
        let unordered = field.kind.is_unordered();
        match &field.kind {
            FieldKind::ForeignKey { model } | FieldKind::ManyToMany { model, .. } => {
                self.canonical_refs(&canonical, |_| Some(model.clone()), false, unordered)
            }
            FieldKind::Polymorphic { candidates, .. } => {
                let declared = entity.discriminator(schema, &field.name);
                let content_type = declared.or_else(|| match candidates.as_slice() {
                    [only] => Some(only.clone()),
                    _ => None,
                });
                self.canonical_refs(&canonical, |_| content_type.clone(), true, unordered)
            }
            FieldKind::Scalar | FieldKind::ScalarSet => canonical,
        }
    }

    fn canonical_refs(
        &self,
        value: &Value,
        target_of: impl Fn(&Reference) -> Option<String> + Copy,
        keep_type: bool,
        unordered: bool,
    ) -> Value {
        match value {
            Value::Ref(r) => {
                let target = target_of(r);
                let key = target
                    .as_deref()
                    .and_then(|t| self.registry.schema(t))
                    .map_or_else(|| r.key.clone(), |s| s.normalize_key(&r.key));
                Value::Ref(Reference {
                    key,
                    content_type: if keep_type { target } else { None },
                })
            }
            Value::List(items) => {
                let mut refs: Vec<Value> = items
                    .iter()
                    .map(|v| self.canonical_refs(v, target_of, keep_type, unordered))
                    .collect();
                // Normalizing keys can reorder or merge entries of a set.
                if unordered {
                    refs.sort();
                    refs.dedup();
                }
                Value::List(refs)
            }
            other => other.clone(),
        }
    }
}

/// Orders entries of a self-referencing type so that an entry referenced by
/// another entry of the batch comes first. Reference cycles inside the batch
/// keep their key order.
fn order_self_references(schema: &EntitySchema, entries: Vec<ChangesetEntry>) -> Vec<ChangesetEntry> {
    let self_fields: Vec<&FieldDef> = schema
        .attributes
        .iter()
        .chain(schema.identifiers.iter())
        .filter(|f| f.kind.targets().contains(&schema.model_type.as_str()))
        .collect();

    let position: BTreeMap<NaturalKey, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (schema.normalize_key(&e.key), i))
        .collect();

    let mut in_degree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        let values = entry
            .new
            .iter()
            .chain(entry.old.iter())
            .chain(entry.identifiers.iter())
            .filter(|(name, _)| self_fields.iter().any(|f| &f.name == *name))
            .map(|(_, v)| v);
        let mut parents = BTreeSet::new();
        for value in values {
            let refs: Vec<&Reference> = match value {
                Value::Ref(r) => vec![r],
                Value::List(items) => items.iter().filter_map(Value::as_reference).collect(),
                _ => Vec::new(),
            };
            for r in refs {
                if let Some(&p) = position.get(&schema.normalize_key(&r.key)) {
                    if p != i {
                        parents.insert(p);
                    }
                }
            }
        }
        for p in parents {
            in_degree[i] += 1;
            dependents[p].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }
    let placed: BTreeSet<usize> = order.iter().copied().collect();
    order.extend((0..entries.len()).filter(|i| !placed.contains(i)));

    let mut slots: Vec<Option<ChangesetEntry>> = entries.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
