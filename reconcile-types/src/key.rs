//! Natural keys.
//!
//! A natural key is the ordered tuple of an entity's identifier values. Its
//! canonical string form joins the parts with [`KEY_SEPARATOR`], which is how
//! keys appear in logs, changesets and the backing store.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between identifier values in the canonical key string.
pub const KEY_SEPARATOR: &str = "__";

/// The canonical key of an entity within its model type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    /// Builds a key from identifier values in schema order.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Shorthand for a key with a single identifier.
    pub fn single(part: impl Into<String>) -> Self {
        Self(vec![part.into()])
    }

    /// Returns the identifier values in schema order.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Number of identifier values in the key.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Parses a canonical key string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::InvalidKey("empty key".into()));
        }
        Ok(Self(s.split(KEY_SEPARATOR).map(str::to_string).collect()))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(KEY_SEPARATOR))
    }
}

impl FromStr for NaturalKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for NaturalKey {
    fn from(s: &str) -> Self {
        Self::single(s)
    }
}
