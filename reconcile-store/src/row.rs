use reconcile_model::OwnershipMarker;
use reconcile_types::{NaturalKey, RecordId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field name → stored value.
pub type FieldMap = BTreeMap<String, StoredValue>;

/// A resolved relationship: the concrete row another row points at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub model_type: String,
    pub id: RecordId,
}

impl Link {
    pub fn new(model_type: impl Into<String>, id: RecordId) -> Self {
        Self {
            model_type: model_type.into(),
            id,
        }
    }
}

/// A field value as persisted. References are stored as links to rows,
/// never as natural keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredValue {
    Plain(Value),
    Link(Link),
    Links(Vec<Link>),
}

impl StoredValue {
    pub fn links(&self) -> &[Link] {
        match self {
            Self::Plain(_) => &[],
            Self::Link(l) => std::slice::from_ref(l),
            Self::Links(ls) => ls,
        }
    }
}

impl From<Value> for StoredValue {
    fn from(v: Value) -> Self {
        Self::Plain(v)
    }
}

/// One row of the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RecordId,
    pub model_type: String,
    pub key: NaturalKey,
    pub fields: FieldMap,
    pub owner: Option<OwnershipMarker>,
    pub status: Option<String>,
    /// Status in force before a soft delete, restored on recovery.
    pub prior_status: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Row {
    /// A fresh, unowned row with no status or tags.
    pub fn new(model_type: impl Into<String>, key: NaturalKey, fields: FieldMap) -> Self {
        Self {
            id: RecordId::new(),
            model_type: model_type.into(),
            key,
            fields,
            owner: None,
            status: None,
            prior_status: None,
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: OwnershipMarker) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Every row this row links to.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.fields.values().flat_map(StoredValue::links)
    }

    /// Applies a partial update in place. Fields absent from the patch are
    /// left untouched.
    pub fn apply_patch(&mut self, patch: &RowPatch) {
        for (name, value) in &patch.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        if let Some(owner) = &patch.owner {
            self.owner = Some(owner.clone());
        }
        match &patch.status {
            Some(StatusChange::SoftDelete { status }) => {
                if self.prior_status.is_none() && self.status.as_deref() != Some(status) {
                    self.prior_status = self.status.take();
                }
                self.status = Some(status.clone());
            }
            Some(StatusChange::Restore { soft_status }) => {
                if self.status.as_deref() == Some(soft_status) {
                    self.status = self.prior_status.take();
                }
            }
            None => {}
        }
        for tag in &patch.add_tags {
            self.tags.insert(tag.clone());
        }
        for tag in &patch.remove_tags {
            self.tags.remove(tag);
        }
    }
}

/// A status transition carried by a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Set the soft-deleted status, remembering the current one.
    SoftDelete { status: String },
    /// Undo a soft delete if the row still carries `soft_status`.
    Restore { soft_status: String },
}

/// A partial update to one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPatch {
    pub fields: FieldMap,
    pub owner: Option<OwnershipMarker>,
    pub status: Option<StatusChange>,
    pub add_tags: BTreeSet<String>,
    pub remove_tags: BTreeSet<String>,
}

impl RowPatch {
    pub fn fields(fields: FieldMap) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Whether applying the patch could change anything.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.owner.is_none()
            && self.status.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
    }

    /// Links introduced by the patch's fields.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.fields.values().flat_map(StoredValue::links)
    }
}
