//! Conflict resolution and delete policy.
//!
//! Blind create/update/delete across independently curated systems is unsafe.
//! These functions decide, per entry, how much of it the active source is
//! allowed to apply.

use reconcile_model::{EntitySchema, OwnershipMarker, SourceKind};
use reconcile_types::SourceId;
use std::fmt;
use std::str::FromStr;

/// What a Delete entry does to the target row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Physically remove the row.
    Hard,
    /// Set the soft-delete status and tag; the row stays.
    #[default]
    Safe,
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hard => f.write_str("hard"),
            Self::Safe => f.write_str("safe"),
        }
    }
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "safe" => Ok(Self::Safe),
            other => Err(format!("unknown delete policy: {other}")),
        }
    }
}

/// The sync source a run writes on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSource {
    pub id: SourceId,
    pub kind: SourceKind,
}

impl ActiveSource {
    pub fn new(id: impl Into<SourceId>, kind: SourceKind) -> Self {
        Self { id: id.into(), kind }
    }

    /// A fresh marker for a write made now.
    pub fn marker(&self) -> OwnershipMarker {
        OwnershipMarker::now(self.id.clone(), self.kind)
    }

    /// Whether `owner` belongs to some other source.
    pub fn is_foreign(&self, owner: Option<&OwnershipMarker>) -> bool {
        owner.is_some_and(|o| !o.is_owned_by(&self.id))
    }
}

/// How much of an Update the active source may apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Apply every changed field and write the active marker.
    Apply,
    /// The row belongs to another source: apply only `allowed`, leave the
    /// marker alone, and report `withheld` as a conflict.
    Partial {
        allowed: Vec<String>,
        withheld: Vec<String>,
    },
    /// Nothing may be applied.
    Conflict,
}

/// Decides an Update against a row currently owned by `owner`.
///
/// Between two different sources, discovery-sourced ownership wins on
/// fields flagged `discovery_precedence`: a declarative source may update
/// every other field of a discovery-owned row, and a discovery source may
/// update only the flagged fields of a declaratively owned row. Two sources
/// of the same kind never overwrite each other.
pub fn decide_update<'a>(
    schema: &EntitySchema,
    owner: Option<&OwnershipMarker>,
    active: &ActiveSource,
    changed: impl IntoIterator<Item = &'a str>,
) -> UpdateDecision {
    let Some(owner) = owner.filter(|o| !o.is_owned_by(&active.id)) else {
        return UpdateDecision::Apply;
    };

    let flagged = |name: &str| {
        schema
            .attribute_def(name)
            .is_some_and(|f| f.discovery_precedence)
    };
    let rule = (owner.kind, active.kind);
    let may_write = |name: &str| match rule {
        (SourceKind::Discovery, SourceKind::Declarative) => !flagged(name),
        (SourceKind::Declarative, SourceKind::Discovery) => flagged(name),
        _ => false,
    };

    let (allowed, withheld): (Vec<&str>, Vec<&str>) =
        changed.into_iter().partition(|n| may_write(*n));
    if allowed.is_empty() {
        return UpdateDecision::Conflict;
    }
    UpdateDecision::Partial {
        allowed: allowed.into_iter().map(str::to_string).collect(),
        withheld: withheld.into_iter().map(str::to_string).collect(),
    }
}

/// Whether a Delete may proceed against a row owned by `owner`.
pub fn may_delete(owner: Option<&OwnershipMarker>, active: &ActiveSource) -> bool {
    !active.is_foreign(owner)
}
