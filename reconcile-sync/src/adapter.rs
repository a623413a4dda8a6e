//! Adapter abstraction.
//!
//! An adapter loads a complete snapshot of one side (an external system or
//! the backing store) into an [`EntityIndex`]. The engines only ever read
//! that index, so any system that can be loaded this way can take part in a
//! sync.

use crate::cancel::CancelToken;
use crate::error::LoadError;
use crate::index::EntityIndex;
use async_trait::async_trait;
use reconcile_model::{Entity, ModelRegistry};
use reconcile_types::{NaturalKey, SourceId};
use std::fmt;
use std::sync::Arc;

/// Predicate restricting which natural keys a load keeps.
#[derive(Clone)]
pub struct ScopeFilter(Arc<dyn Fn(&str, &NaturalKey) -> bool + Send + Sync>);

impl ScopeFilter {
    pub fn new(f: impl Fn(&str, &NaturalKey) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Keeps only keys whose first part is `container` (e.g. a site name).
    /// Model types outside `models` are not restricted.
    pub fn under(container: impl Into<String>, models: &[&str]) -> Self {
        let container = container.into();
        let models: Vec<String> = models.iter().map(|m| (*m).to_string()).collect();
        Self::new(move |model_type, key| {
            !models.iter().any(|m| m == model_type)
                || key.parts().first().is_some_and(|p| *p == container)
        })
    }

    pub fn allows(&self, model_type: &str, key: &NaturalKey) -> bool {
        (self.0)(model_type, key)
    }
}

impl fmt::Debug for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScopeFilter(..)")
    }
}

/// What an adapter needs to know to load.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub registry: Arc<ModelRegistry>,
    /// Keys outside the scope are not loaded.
    pub scope: Option<ScopeFilter>,
    /// Datastore adapters keep only rows owned by this source when set.
    pub owned_by: Option<SourceId>,
    pub cancel: CancelToken,
}

impl LoadContext {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            scope: None,
            owned_by: None,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Option<ScopeFilter>) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn owned_by(mut self, source: Option<SourceId>) -> Self {
        self.owned_by = source;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn in_scope(&self, model_type: &str, key: &NaturalKey) -> bool {
        self.scope.as_ref().is_none_or(|s| s.allows(model_type, key))
    }
}

/// One side of a sync.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable name, used in logs and errors.
    fn name(&self) -> &str;

    /// Populates the index from scratch. A failed load leaves nothing to
    /// diff against; partial loads are never reported as success.
    async fn load(&mut self, ctx: &LoadContext) -> Result<(), LoadError>;

    /// The loaded snapshot.
    fn index(&self) -> &EntityIndex;

    fn get(&self, model_type: &str, key: &NaturalKey) -> Option<&Entity> {
        self.index().get(model_type, key)
    }

    /// Every entity of one model type, in natural-key order. Each call
    /// starts from the beginning.
    fn all(&self, model_type: &str) -> Vec<&Entity> {
        self.index().all(model_type).collect()
    }
}
