//! Changesets: the ordered plan a diff produces and the apply engine consumes.

use crate::error::EntryError;
use reconcile_model::{AttrMap, Entity, EntityMeta, OwnershipMarker};
use reconcile_types::{NaturalKey, RecordId, Value};
use std::collections::BTreeSet;
use std::fmt;

/// A planned operation on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// What applying an entry actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// An unowned target row was taken over by the active source.
    Claimed,
    /// A soft-deleted row was re-observed and restored.
    Recovered,
    Deleted,
    SoftDeleted,
    SkippedConflict,
    Failed(EntryError),
    /// Applied, then undone when its transaction batch was rolled back.
    RolledBack,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether the write is (still) in effect.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Updated
                | Self::Claimed
                | Self::Recovered
                | Self::Deleted
                | Self::SoftDeleted
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Claimed => f.write_str("claimed"),
            Self::Recovered => f.write_str("recovered"),
            Self::Deleted => f.write_str("deleted"),
            Self::SoftDeleted => f.write_str("soft-deleted"),
            Self::SkippedConflict => f.write_str("skipped (conflict)"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// One planned operation.
///
/// `old` and `new` hold attribute values: for an Update only the changed
/// fields, for a Create every source attribute (`old` empty), for a Delete
/// every target attribute (`new` empty).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetEntry {
    pub model_type: String,
    pub key: NaturalKey,
    pub operation: Operation,
    pub identifiers: AttrMap,
    pub old: AttrMap,
    pub new: AttrMap,
    /// Target row, when the target side is a datastore.
    pub record_id: Option<RecordId>,
    /// Ownership marker the target carried at load time.
    pub target_owner: Option<OwnershipMarker>,
    /// The target row has no marker and will be claimed.
    pub claim: bool,
    /// The target row is soft-deleted and will be restored.
    pub recover: bool,
    outcome: Option<Outcome>,
}

impl ChangesetEntry {
    fn new(
        operation: Operation,
        model_type: &str,
        key: &NaturalKey,
        identifiers: AttrMap,
    ) -> Self {
        Self {
            model_type: model_type.to_string(),
            key: key.clone(),
            operation,
            identifiers,
            old: AttrMap::new(),
            new: AttrMap::new(),
            record_id: None,
            target_owner: None,
            claim: false,
            recover: false,
            outcome: None,
        }
    }

    /// Approximate bytes held by the entry, heap contents included.
    pub fn estimated_size(&self) -> usize {
        let key: usize = self.key.parts().iter().map(String::len).sum();
        let fields: usize = self
            .identifiers
            .iter()
            .chain(self.old.iter())
            .chain(self.new.iter())
            .map(|(k, v)| k.len() + v.estimated_size())
            .sum();
        std::mem::size_of::<Self>() + self.model_type.len() + key + fields
    }

    /// Creates `source` in the target.
    pub fn create(source: &Entity) -> Self {
        let mut entry = Self::new(
            Operation::Create,
            &source.model_type,
            &source.key,
            source.identifiers.clone(),
        );
        entry.new = source.attributes.clone();
        entry
    }

    /// Brings `target` in line with the source; `old`/`new` hold only the
    /// changed fields.
    pub fn update(target: &Entity, old: AttrMap, new: AttrMap) -> Self {
        let mut entry = Self::new(
            Operation::Update,
            &target.model_type,
            &target.key,
            target.identifiers.clone(),
        );
        entry.old = old;
        entry.new = new;
        entry.with_target(&target.meta)
    }

    /// Removes `target`.
    pub fn delete(target: &Entity) -> Self {
        let mut entry = Self::new(
            Operation::Delete,
            &target.model_type,
            &target.key,
            target.identifiers.clone(),
        );
        entry.old = target.attributes.clone();
        entry.with_target(&target.meta)
    }

    fn with_target(mut self, meta: &EntityMeta) -> Self {
        self.record_id = meta.record_id;
        self.target_owner = meta.owner.clone();
        self
    }

    /// Changed (or, for Create/Delete, carried) attribute names.
    pub fn fields(&self) -> BTreeSet<&str> {
        self.old
            .keys()
            .chain(self.new.keys())
            .map(String::as_str)
            .collect()
    }

    /// Identifiers plus `new` values, as an entity for handler hooks.
    pub fn source_entity(&self) -> Entity {
        Entity {
            model_type: self.model_type.clone(),
            key: self.key.clone(),
            identifiers: self.identifiers.clone(),
            attributes: self.new.clone(),
            meta: EntityMeta::default(),
        }
    }

    /// Identifiers plus `old` values, as an entity for handler hooks.
    pub fn target_entity(&self) -> Entity {
        Entity {
            model_type: self.model_type.clone(),
            key: self.key.clone(),
            identifiers: self.identifiers.clone(),
            attributes: self.old.clone(),
            meta: EntityMeta {
                record_id: self.record_id,
                owner: self.target_owner.clone(),
                ..EntityMeta::default()
            },
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Records the result of applying this entry. Only the first call
    /// takes effect; returns whether it did.
    pub fn mark(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Reverts an applied outcome after its batch was rolled back.
    pub(crate) fn mark_rolled_back(&mut self) {
        if self.outcome.as_ref().is_some_and(Outcome::is_applied) {
            self.outcome = Some(Outcome::RolledBack);
        }
    }

    /// One-line description plus per-field lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = self.write_diff(&mut out);
        out
    }

    fn write_diff(&self, f: &mut impl fmt::Write) -> fmt::Result {
        let sign = match self.operation {
            Operation::Create => '+',
            Operation::Update => '~',
            Operation::Delete => '-',
        };
        write!(f, "{sign} {} {}", self.model_type, self.key)?;
        if self.claim {
            f.write_str(" (claim)")?;
        }
        if self.recover {
            f.write_str(" (recover)")?;
        }
        writeln!(f)?;
        match self.operation {
            Operation::Create => {
                for (name, value) in self.new.iter().filter(|(_, v)| !v.is_null()) {
                    writeln!(f, "    {name}: {value}")?;
                }
            }
            Operation::Update => {
                for name in self.fields() {
                    let old = self.old.get(name).unwrap_or(&Value::Null);
                    let new = self.new.get(name).unwrap_or(&Value::Null);
                    writeln!(f, "    {name}: {old} → {new}")?;
                }
            }
            Operation::Delete => {}
        }
        Ok(())
    }
}

/// Kinds of non-fatal diff findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// The source held two records with the same natural key; both were
    /// left out of the diff.
    DuplicateSourceRecord,
    /// A soft-deleted target was re-observed but its type does not
    /// recover automatically.
    RecoveryDisabled,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSourceRecord => f.write_str("DuplicateSourceRecord"),
            Self::RecoveryDisabled => f.write_str("RecoveryDisabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWarning {
    pub kind: WarningKind,
    pub model_type: String,
    pub key: NaturalKey,
    pub message: String,
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}: {}", self.kind, self.model_type, self.key, self.message)
    }
}

/// Entry counts by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    /// Keys present on both sides with nothing to do.
    pub no_change: usize,
}

/// An ordered list of operations: model types in dependency order, and
/// within one model type creates, then updates, then deletes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    entries: Vec<ChangesetEntry>,
    warnings: Vec<SyncWarning>,
    no_change: usize,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: ChangesetEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn warn(&mut self, warning: SyncWarning) {
        self.warnings.push(warning);
    }

    pub(crate) fn count_unchanged(&mut self) {
        self.no_change += 1;
    }

    pub fn entries(&self) -> &[ChangesetEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [ChangesetEntry] {
        &mut self.entries
    }

    pub fn warnings(&self) -> &[SyncWarning] {
        &self.warnings
    }

    /// True when there is nothing to apply. Warnings do not count.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn estimated_size(&self) -> usize {
        self.entries.iter().map(ChangesetEntry::estimated_size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangesetEntry> {
        self.entries.iter()
    }

    /// Entries of one model type, in order.
    pub fn for_model<'a>(&'a self, model_type: &'a str) -> impl Iterator<Item = &'a ChangesetEntry> {
        self.entries.iter().filter(move |e| e.model_type == model_type)
    }

    /// Keys with the given operation in one model type.
    pub fn keys(&self, model_type: &str, operation: Operation) -> BTreeSet<NaturalKey> {
        self.entries
            .iter()
            .filter(|e| e.model_type == model_type && e.operation == operation)
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary {
            no_change: self.no_change,
            ..DiffSummary::default()
        };
        for entry in &self.entries {
            match entry.operation {
                Operation::Create => summary.create += 1,
                Operation::Update => summary.update += 1,
                Operation::Delete => summary.delete += 1,
            }
        }
        summary
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            entry.write_diff(f)?;
        }
        for warning in &self.warnings {
            writeln!(f, "! {warning}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Changeset {
    type Item = &'a ChangesetEntry;
    type IntoIter = std::slice::Iter<'a, ChangesetEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
