//! Attribute values.
//!
//! Entity attributes are scalars, lists, or relationship references. A
//! reference always points at another entity by natural key; turning it into
//! a backing-store link happens at apply time.

use crate::NaturalKey;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to another entity by natural key.
///
/// `content_type` is the discriminator for polymorphic relations. It is
/// `None` for plain foreign keys, whose target model is fixed by the schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    pub key: NaturalKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Reference {
    /// A reference whose target model is fixed by the schema.
    pub fn to(key: impl Into<NaturalKey>) -> Self {
        Self {
            key: key.into(),
            content_type: None,
        }
    }

    /// A polymorphic reference carrying its own discriminator.
    pub fn typed(content_type: impl Into<String>, key: impl Into<NaturalKey>) -> Self {
        Self {
            key: key.into(),
            content_type: Some(content_type.into()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content_type {
            Some(ct) => write!(f, "{ct}:{}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// A single attribute or identifier value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Any JSON number that is not an integer.
    Float(OrderedFloat<f64>),
    Text(String),
    List(Vec<Value>),
    Ref(Reference),
}

impl Value {
    /// Builds a list of references, as used by many-to-many attributes.
    pub fn refs<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<NaturalKey>,
    {
        Self::List(keys.into_iter().map(|k| Self::Ref(Reference::to(k))).collect())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(f.0),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Rough heap footprint, for load and diff statistics.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::List(items) => items.iter().map(Self::estimated_size).sum::<usize>() + 8,
            Self::Ref(r) => r.key.parts().iter().map(String::len).sum::<usize>() + 16,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) => 8,
        }
    }

    /// Renders the value as an identifier component.
    ///
    /// Returns `None` for values that cannot take part in a natural key
    /// (null, lists).
    #[must_use]
    pub fn key_part(&self) -> Option<String> {
        match self {
            Self::Null | Self::List(_) => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Ref(r) => Some(r.key.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Ref(r) => write!(f, "<{r}>"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(OrderedFloat(f))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Ref(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
