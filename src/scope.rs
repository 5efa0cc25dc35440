use std::{
    any::Any,
    sync::{Arc, Mutex, Weak},
};

use derive_ex::Ex;

use crate::{
    Subscription,
    call_context::{BatchContext, CallContext},
    cancel::{CancelId, CancelKey, Cancellable},
    core::{Hold, HookKind, NodeId, Presence, RootShared, State, TreeCore, WriteOrigin},
    error::{Error, Result},
    event::{Event, EventReceiver, Receivers},
    lens::{Lens, LensId},
    observe::{Comparator, Refresh, TrackKey},
    structure::Tracker,
};

mod model;

pub use model::*;

#[cfg(test)]
mod tests;

/// Typed access to the value a scope addresses, forwarded up the lens chain to the root.
pub(crate) trait Backend<T>: Send + Sync {
    fn with(&self, f: &mut dyn FnMut(Option<&T>));

    /// Returns `false` if the write was dropped because an override is active.
    fn write(&self, origin: &WriteOrigin, f: &mut dyn FnMut(&mut T)) -> Result<bool>;

    fn track(&self, node: NodeId, observer: usize, key: TrackKey, comparator: Comparator<T>);
    fn add_tracker(&self, node: NodeId, tracker: Tracker<T>) -> Option<usize>;
}

/// Root operations that do not depend on the state type.
pub(crate) trait RootOps: Send + Sync {
    fn core(&self) -> &Arc<TreeCore>;
    fn flush(&self);
    fn insert_observer(&self, node: NodeId, is_override: bool, on_refresh: Refresh) -> Option<usize>;
    fn remove_observer(&self, node: NodeId, key: usize);
    fn reset_observer(&self, node: NodeId, key: usize);
    fn remove_tracker(&self, node: NodeId, key: usize) -> Vec<NodeId>;
    fn sync_tracker(&self, node: NodeId, key: usize);
}

struct LensBackend<P, C> {
    parent: Arc<dyn Backend<P>>,
    lens: Lens<P, C>,
    path: LensId,
}

impl<P: State, C: State> Backend<C> for LensBackend<P, C> {
    fn with(&self, f: &mut dyn FnMut(Option<&C>)) {
        self.parent.with(&mut |p| match p {
            Some(p) => self.lens.with(p, |c| f(c)),
            None => f(None),
        })
    }

    fn write(&self, origin: &WriteOrigin, f: &mut dyn FnMut(&mut C)) -> Result<bool> {
        if !self.lens.is_writable() {
            return Err(Error::ReadOnlyLens(self.path.clone()));
        }
        let mut found = false;
        let applied = self.parent.write(origin, &mut |p| {
            if let Some(c) = self.lens.get_mut(p) {
                found = true;
                f(c)
            }
        })?;
        if applied && !found {
            return Err(Error::Missing(self.path.clone()));
        }
        Ok(applied)
    }

    fn track(&self, node: NodeId, observer: usize, key: TrackKey, comparator: Comparator<C>) {
        self.parent
            .track(node, observer, key, comparator.through(self.lens.clone()))
    }
    fn add_tracker(&self, node: NodeId, tracker: Tracker<C>) -> Option<usize> {
        self.parent
            .add_tracker(node, tracker.through(self.lens.clone()))
    }
}

trait Resolve: Send + Sync {
    fn resolve(&self) -> Result<NodeId>;
}

struct ScopeInner<T> {
    backend: Arc<dyn Backend<T>>,
    root: Arc<dyn RootOps>,
    parent: Option<Arc<dyn Resolve>>,
    key: LensId,
    path: LensId,
    is_override: bool,
    node: Mutex<Option<NodeId>>,
}

impl<T: State> ScopeInner<T> {
    fn exists(&self) -> bool {
        let mut exists = false;
        self.backend.with(&mut |value| exists = value.is_some());
        exists
    }
}

impl<T: State> Presence for ScopeInner<T> {
    fn exists(&self) -> bool {
        ScopeInner::exists(self)
    }
}

impl<T: State> Resolve for ScopeInner<T> {
    /// Returns the node of this scope, recreating it through the parent chain if it was torn
    /// down while the state it addresses still exists.
    fn resolve(&self) -> Result<NodeId> {
        let core = self.root.core();
        let cached = *self.node.lock().unwrap();
        if let Some(id) = cached
            && core.contains(id)
        {
            return Ok(id);
        }
        let id = match &self.parent {
            None => core.root().ok_or(Error::StoreDropped)?,
            Some(parent) => {
                let parent = parent.resolve()?;
                if !self.exists() {
                    return Err(Error::Detached(self.path.clone()));
                }
                core.child(parent, &self.key, self.is_override)
                    .ok_or_else(|| Error::Detached(self.path.clone()))?
            }
        };
        *self.node.lock().unwrap() = Some(id);
        Ok(id)
    }
}

fn memoized<T: State>(
    core: &TreeCore,
    node: Option<NodeId>,
    is_override: bool,
    make: impl FnOnce() -> ScopeInner<T>,
) -> Arc<ScopeInner<T>> {
    if let Some(node) = node
        && let Some(inner) = core
            .handle::<Weak<ScopeInner<T>>>(node, is_override)
            .and_then(|weak| weak.upgrade())
    {
        return inner;
    }
    let inner = Arc::new(make());
    if let Some(node) = node {
        let presence: Weak<dyn Presence> = Arc::downgrade(&inner) as Weak<ScopeInner<T>>;
        core.set_handle(node, is_override, Arc::downgrade(&inner), presence);
    }
    inner
}

/// Handle to one node of a state tree, addressing a `T` inside the root state.
///
/// Handles are cheap to clone. Reads always go to the root's current snapshot; a scope never
/// caches a copy of its value.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct Scope<T> {
    inner: Arc<ScopeInner<T>>,
    cancel_keys: Vec<CancelKey>,
    batch: BatchContext,
}

impl<S: State> Scope<S> {
    pub(crate) fn root(shared: Arc<RootShared<S>>, is_override: bool) -> Self {
        let core = shared.core().clone();
        let node = core.root();
        let inner = memoized(&core, node, is_override, || ScopeInner {
            backend: shared.clone(),
            root: shared,
            parent: None,
            key: LensId::root(),
            path: LensId::root(),
            is_override,
            node: Mutex::new(node),
        });
        Scope {
            inner,
            cancel_keys: Vec::new(),
            batch: BatchContext::new(),
        }
    }
}

impl<T: State> Scope<T> {
    pub(crate) fn core(&self) -> &Arc<TreeCore> {
        self.inner.root.core()
    }
    pub(crate) fn root_ops(&self) -> &Arc<dyn RootOps> {
        &self.inner.root
    }
    pub(crate) fn backend(&self) -> &Arc<dyn Backend<T>> {
        &self.inner.backend
    }
    pub(crate) fn detached(&self) -> Error {
        match self.core().root() {
            Some(_) => Error::Detached(self.inner.path.clone()),
            None => Error::StoreDropped,
        }
    }

    /// Path from the root to this scope.
    pub fn path(&self) -> &LensId {
        &self.inner.path
    }
    /// Whether this scope belongs to the override tree.
    pub fn is_override(&self) -> bool {
        self.inner.is_override
    }
    /// The node backing this scope.
    pub fn node(&self) -> Result<NodeId> {
        self.inner.resolve()
    }
    /// Whether the addressed value exists in the current snapshot.
    pub fn exists(&self) -> bool {
        self.inner.exists()
    }

    /// Calls `f` with the current value, `None` if it does not exist.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let mut f = Some(f);
        let mut result = None;
        self.inner.backend.with(&mut |value| {
            if let Some(f) = f.take() {
                result = Some(f(value));
            }
        });
        result.expect("backend did not call back")
    }

    /// The current value.
    ///
    /// # Panics
    ///
    /// Panics if the value does not exist (removed element, `None` optional).
    pub fn get(&self) -> T {
        self.try_get()
            .unwrap_or_else(|| panic!("no value at `{}`", self.path()))
    }
    pub fn try_get(&self) -> Option<T> {
        self.with(|value| value.cloned())
    }
    pub fn read<C: State>(&self, lens: &Lens<T, C>) -> Option<C> {
        self.with(|value| value.and_then(|v| lens.get(v)))
    }

    fn write_raw(&self, f: &mut dyn FnMut(&mut T)) -> Result<bool> {
        let origin = WriteOrigin {
            node: self.node()?,
            batch: self.batch.clone(),
            is_override: self.inner.is_override,
        };
        self.inner.backend.write(&origin, f)
    }

    /// Mutates the value.
    ///
    /// While an override is active, writes through live scopes are dropped and `Ok` is
    /// returned. `f` must not access the store.
    pub fn write(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut f = Some(f);
        self.write_raw(&mut |value| {
            if let Some(f) = f.take() {
                f(value)
            }
        })?;
        Ok(())
    }
    pub fn set(&self, value: T) -> Result<()> {
        self.write(|v| *v = value)
    }

    /// Mutates the value `lens` reaches.
    pub fn write_at<C: State>(&self, lens: &Lens<T, C>, f: impl FnOnce(&mut C)) -> Result<()> {
        if !lens.is_writable() {
            return Err(Error::ReadOnlyLens(self.path().join(lens.id())));
        }
        let mut f = Some(f);
        let mut found = false;
        let applied = self.write_raw(&mut |value| {
            if let Some(c) = lens.get_mut(value)
                && let Some(f) = f.take()
            {
                found = true;
                f(c)
            }
        })?;
        if applied && !found {
            return Err(Error::Missing(self.path().join(lens.id())));
        }
        Ok(())
    }

    /// Publishes pending writes of the store now.
    pub fn flush(&self) {
        self.inner.root.flush()
    }

    fn child<U: State>(&self, lens: Lens<T, U>) -> Scope<U> {
        let key = lens.id().clone();
        let path = self.inner.path.join(&key);
        let is_override = self.inner.is_override;
        let core = self.core();
        let node = self
            .node()
            .ok()
            .and_then(|parent| core.child(parent, &key, is_override));
        let inner = memoized(core, node, is_override, || ScopeInner {
            backend: Arc::new(LensBackend {
                parent: self.inner.backend.clone(),
                lens,
                path: path.clone(),
            }),
            root: self.inner.root.clone(),
            parent: Some(self.inner.clone()),
            key,
            path,
            is_override,
            node: Mutex::new(node),
        });
        Scope {
            inner,
            cancel_keys: self.cancel_keys.clone(),
            batch: self.batch.clone(),
        }
    }

    /// The child scope reached by `lens`, created on first access and shared afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `lens` is not a single step: a child must be reached through every
    /// intermediate scope, so that each of them registers its own activation. Use
    /// [`scope_at`](Self::scope_at) for a lookup that only reads.
    pub fn scope<U: State>(&self, lens: Lens<T, U>) -> Scope<U> {
        assert!(
            lens.id().len() == 1,
            "scope lookup from `{}` through `{}` must be a single step",
            self.path(),
            lens.id()
        );
        self.child(lens)
    }

    /// The child scope reached by `lens`, which may be composed of several steps.
    pub fn scope_at<U: State>(&self, lens: Lens<T, U>) -> Scope<U> {
        self.child(lens)
    }

    /// Keeps the scope active until the returned subscription is dropped.
    pub fn retain(&self) -> Result<Subscription> {
        let node = self.node()?;
        if !self.core().retain(node, Hold::Observer) {
            return Err(self.detached());
        }
        Ok(Subscription::from_weak_fn(
            Arc::downgrade(self.core()),
            move |core| core.release(node, Hold::Observer),
        ))
    }
    pub fn is_active(&self) -> bool {
        self.node().is_ok_and(|node| self.core().is_active(node))
    }

    fn add_hook(
        &self,
        kind: HookKind,
        f: impl Fn(&Scope<T>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let node = self.node()?;
        let scope = self.clone();
        let key = self
            .core()
            .add_scope_hook(node, kind, Arc::new(move || f(&scope)))
            .ok_or_else(|| self.detached())?;
        Ok(Subscription::from_weak_fn(
            Arc::downgrade(self.core()),
            move |core| core.remove_scope_hook(&key),
        ))
    }

    /// Runs `f` each time the scope becomes active, and now if it is active.
    ///
    /// The hook stays registered until the subscription is dropped, also across teardowns: a
    /// scope re-activated after being torn down runs it again.
    pub fn on_activate(&self, f: impl Fn(&Scope<T>) + Send + Sync + 'static) -> Result<Subscription> {
        self.add_hook(HookKind::Activate, f)
    }
    /// Runs `f` each time the scope stops being active.
    pub fn on_deactivate(
        &self,
        f: impl Fn(&Scope<T>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.add_hook(HookKind::Deactivate, f)
    }

    /// Call contexts of writes made through this handle.
    pub fn batch(&self) -> &BatchContext {
        &self.batch
    }

    /// Runs `f` with a handle whose writes carry `context` in addition to the current ones.
    pub fn with_call_context<R>(&self, context: CallContext, f: impl FnOnce(&Scope<T>) -> R) -> R {
        let scope = Scope {
            inner: self.inner.clone(),
            cancel_keys: self.cancel_keys.clone(),
            batch: self.batch.push(context),
        };
        f(&scope)
    }

    /// Keys every cancellable registered through this handle is also registered under.
    pub fn cancellation_keys(&self) -> &[CancelKey] {
        &self.cancel_keys
    }

    /// Runs `f` with a handle that registers cancellables under `key` as well.
    pub fn with_cancellation_context<R>(&self, key: CancelKey, f: impl FnOnce(&Scope<T>) -> R) -> R {
        let mut cancel_keys = self.cancel_keys.clone();
        if !cancel_keys.contains(&key) {
            cancel_keys.push(key);
        }
        let scope = Scope {
            inner: self.inner.clone(),
            cancel_keys,
            batch: self.batch.clone(),
        };
        f(&scope)
    }

    pub(crate) fn register(
        &self,
        extra_keys: Vec<CancelKey>,
        in_flight: Option<CancelKey>,
        cancellable: Cancellable,
    ) -> Result<CancelId> {
        let node = self.node()?;
        let keys = self.cancel_keys.iter().cloned().chain(extra_keys).collect();
        self.core()
            .register(node, keys, in_flight, cancellable)
            .ok_or_else(|| self.detached())
    }

    /// Registers `cancellable` for the lifetime of this scope; it is cancelled when the scope
    /// deactivates or is torn down, or when one of its keys is cancelled.
    pub fn register_cancellable(&self, cancellable: Cancellable) -> Result<CancelId> {
        self.register(Vec::new(), None, cancellable)
    }
    /// Like [`register_cancellable`](Self::register_cancellable), first cancelling everything
    /// pending under `key`.
    pub fn register_cancellable_in_flight(
        &self,
        key: CancelKey,
        cancellable: Cancellable,
    ) -> Result<CancelId> {
        self.register(Vec::new(), Some(key), cancellable)
    }

    /// Cancels everything registered under `key` anywhere in the store.
    pub fn cancel_all(&self, key: &CancelKey) -> usize {
        self.core().cancel_key(key)
    }
    /// Cancels everything registered under this scope's lifecycle.
    pub fn cancel_tasks(&self) -> usize {
        self.node().map_or(0, |node| self.core().cancel_node(node))
    }
    pub fn cancel(&self, id: CancelId) -> bool {
        self.core().cancel(id)
    }
    /// Number of cancellables registered under this scope's lifecycle.
    pub fn pending_tasks(&self) -> usize {
        self.node().map_or(0, |node| self.core().pending_for(node))
    }

    /// Sends `payload` to the scopes selected by `receivers`.
    pub fn send_event(&self, payload: impl Any + Send + Sync, receivers: Receivers) -> Result<()> {
        let node = self.node()?;
        let payload: Arc<dyn Any + Send + Sync> = Arc::new(payload);
        let batch = self.batch.clone();
        let sent = self.core().send_event(
            node,
            |path| Event::new(payload, path, node, batch),
            receivers,
        );
        if sent { Ok(()) } else { Err(self.detached()) }
    }

    /// Subscribes to the events delivered to this scope.
    pub fn events(&self) -> Result<EventReceiver> {
        let node = self.node()?;
        self.core()
            .subscribe_events(node)
            .ok_or_else(|| self.detached())
    }
}

impl<T> std::fmt::Debug for Scope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("path", &self.inner.path)
            .field("is_override", &self.inner.is_override)
            .finish_non_exhaustive()
    }
}
