use std::{
    any::TypeId,
    sync::Arc,
};

use crate::{
    core::{AccessId, HookKind, State},
    lens::Lens,
};

use super::Scope;

/// A value built from a scope and cached on its node.
///
/// Building must only read state; mutating the store while a model is being built panics.
pub trait Model: Sized + Send + Sync + 'static {
    type State: State;

    fn build(cx: &BuildContext<Self::State>) -> Self;

    /// Called each time the scope the model is cached on becomes active.
    fn on_activate(&self, scope: &Scope<Self::State>) {
        let _ = scope;
    }
}

/// Identity of a logical call site that materializes models.
///
/// Models are cached per token and per type. Entries of a dropped token are evicted.
#[derive(Clone, Debug)]
pub struct AccessToken(Arc<AccessId>);

impl AccessToken {
    pub fn new() -> Self {
        Self(Arc::new(AccessId::next()))
    }
    pub fn id(&self) -> AccessId {
        *self.0
    }
}

impl Default for AccessToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
impl Eq for AccessToken {}

/// Read access to a scope while one of its models is built.
pub struct BuildContext<T: State> {
    scope: Scope<T>,
    token: AccessToken,
}

impl<T: State> BuildContext<T> {
    /// The scope the model is built for; the model may keep it to write later.
    pub fn scope(&self) -> &Scope<T> {
        &self.scope
    }
    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub fn get(&self) -> T {
        self.scope.get()
    }
    pub fn try_get(&self) -> Option<T> {
        self.scope.try_get()
    }
    pub fn read<C: State>(&self, lens: &Lens<T, C>) -> Option<C> {
        self.scope.read(lens)
    }

    /// The child scope reached by the single-step `lens`.
    pub fn child<U: State>(&self, lens: Lens<T, U>) -> Scope<U> {
        self.scope.scope(lens)
    }

    /// The model of the child scope reached by `lens`, built with the same access token.
    pub fn model<M: Model>(&self, lens: Lens<T, M::State>) -> Arc<M> {
        self.scope.scope(lens).model(&self.token)
    }
}

impl<T: State> Scope<T> {
    /// The `M` cached on this scope for `token`, building it on first use.
    pub fn model<M: Model<State = T>>(&self, token: &AccessToken) -> Arc<M> {
        let type_id = TypeId::of::<M>();
        let Ok(node) = self.node() else {
            tracing::debug!(path = %self.path(), "building an uncached model of a detached scope");
            return Arc::new(self.build_model(token));
        };
        let core = self.core();
        if let Some(model) = core
            .model(node, token.id(), type_id)
            .and_then(|model| model.downcast::<M>().ok())
        {
            return model;
        }
        let model = Arc::new(self.build_model::<M>(token));
        let Some((cached, first_of_type)) = core.insert_model(node, &token.0, type_id, model.clone())
        else {
            return model;
        };
        if first_of_type {
            let scope = self.clone();
            core.add_hook(
                node,
                HookKind::Activate,
                Arc::new(move || {
                    if let Some(model) = scope
                        .core()
                        .any_model(node, type_id)
                        .and_then(|model| model.downcast::<M>().ok())
                    {
                        model.on_activate(&scope);
                    }
                }),
            );
        }
        cached.downcast::<M>().unwrap_or(model)
    }

    fn build_model<M: Model<State = T>>(&self, token: &AccessToken) -> M {
        let _guard = self.core().begin_build();
        M::build(&BuildContext {
            scope: self.clone(),
            token: token.clone(),
        })
    }

    /// Drops the cached models whose access token is gone; returns how many were dropped.
    pub fn evict_stale_models(&self) -> usize {
        self.node()
            .map_or(0, |node| self.core().evict_stale_models(node))
    }

    /// Number of models cached on this scope.
    pub fn model_count(&self) -> usize {
        self.node().map_or(0, |node| self.core().model_count(node))
    }
}
