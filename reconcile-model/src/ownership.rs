use chrono::{DateTime, Utc};
use reconcile_types::SourceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a source learns about the entities it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Observes live state (network discovery, controllers).
    Discovery,
    /// Reports intended state curated by people (IPAM, CMDB).
    Declarative,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => f.write_str("discovery"),
            Self::Declarative => f.write_str("declarative"),
        }
    }
}

/// Records which sync source last wrote an entity.
///
/// A row without a marker is locally owned and may be claimed by the first
/// source that reports the same natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipMarker {
    pub source: SourceId,
    pub kind: SourceKind,
    pub synced_at: DateTime<Utc>,
}

impl OwnershipMarker {
    /// A marker stamped with the current time.
    pub fn now(source: SourceId, kind: SourceKind) -> Self {
        Self {
            source,
            kind,
            synced_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, source: &SourceId) -> bool {
        &self.source == source
    }
}
