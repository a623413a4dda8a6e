//! Field normalization.
//!
//! Two systems rarely format the same fact identically ("Core" vs "core",
//! "host.example.com." vs "host.example.com"). Each field declares the rules
//! that make such values compare equal; the diff engine only ever compares
//! canonical forms, so formatting noise never produces an Update.

use crate::schema::{FieldDef, FieldKind};
use reconcile_types::{NaturalKey, Reference, Value};
use serde::{Deserialize, Serialize};

/// A single text normalization rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Lowercase,
    Uppercase,
    /// Strip leading and trailing whitespace.
    Trim,
    /// Replace internal whitespace runs with a single space.
    CollapseWhitespace,
    /// Strip any trailing characters from the given set.
    TrimTrailing(String),
    /// Treat an empty string as null.
    EmptyAsNull,
}

impl Normalization {
    fn apply(&self, s: &str) -> String {
        match self {
            Self::Lowercase => s.to_lowercase(),
            Self::Uppercase => s.to_uppercase(),
            Self::Trim => s.trim().to_string(),
            Self::CollapseWhitespace => s.split_whitespace().collect::<Vec<_>>().join(" "),
            Self::TrimTrailing(chars) => s.trim_end_matches(|c| chars.contains(c)).to_string(),
            Self::EmptyAsNull => s.to_string(),
        }
    }
}

fn normalize_text(s: &str, rules: &[Normalization]) -> String {
    rules
        .iter()
        .fold(s.to_string(), |acc, rule| rule.apply(&acc))
}

/// Applies `rules` to every text fragment of `value`, including the key
/// parts of references.
pub fn normalize_value(value: &Value, rules: &[Normalization]) -> Value {
    if rules.is_empty() {
        return value.clone();
    }
    match value {
        Value::Text(s) => {
            let out = normalize_text(s, rules);
            if out.is_empty() && rules.contains(&Normalization::EmptyAsNull) {
                Value::Null
            } else {
                Value::Text(out)
            }
        }
        Value::List(items) => Value::List(items.iter().map(|v| normalize_value(v, rules)).collect()),
        Value::Ref(r) => Value::Ref(Reference {
            key: NaturalKey::new(r.key.parts().iter().map(|p| normalize_text(p, rules))),
            content_type: r.content_type.clone(),
        }),
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => value.clone(),
    }
}

/// The comparable form of a field value: normalized, and for unordered
/// collections sorted and de-duplicated. A null collection equals an empty one.
pub fn canonicalize(field: &FieldDef, value: &Value) -> Value {
    let normalized = normalize_value(value, &field.normalize);
    let is_collection = matches!(
        field.kind,
        FieldKind::ScalarSet | FieldKind::ManyToMany { .. }
    );
    match normalized {
        Value::Null if is_collection => Value::List(Vec::new()),
        Value::List(mut items) if field.kind.is_unordered() => {
            items.sort();
            items.dedup();
            Value::List(items)
        }
        other => other,
    }
}
