//! Identity-based diffing of collection-shaped state.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

use crate::{
    Subscription,
    core::{Hold, NodeId, State},
    error::Result,
    lens::{ElementKey, Identified, Lens, Segment},
    scope::Scope,
};


/// State made of elements with stable identities: a collection or an optional value.
pub trait Structural: State {
    type Element: State;

    /// Identities of the elements, in order.
    fn element_keys(&self) -> Vec<Segment>;

    /// The lens reaching the element identified by `key`, `None` if `key` cannot identify an
    /// element of this type.
    fn element_lens(key: &Segment) -> Option<Lens<Self, Self::Element>>;
}

impl<T: State + Identified> Structural for Vec<T> {
    type Element = T;

    fn element_keys(&self) -> Vec<Segment> {
        self.iter()
            .map(|item| Segment::Key(ElementKey::new(item.id())))
            .collect()
    }
    fn element_lens(key: &Segment) -> Option<Lens<Self, T>> {
        match key {
            Segment::Key(key) => Some(Lens::element(key.downcast_ref::<T::Id>()?.clone())),
            _ => None,
        }
    }
}

impl<T: State> Structural for Option<T> {
    type Element = T;

    fn element_keys(&self) -> Vec<Segment> {
        match self {
            Some(_) => vec![Segment::Some],
            None => Vec::new(),
        }
    }
    fn element_lens(key: &Segment) -> Option<Lens<Self, T>> {
        match key {
            Segment::Some => Some(Lens::some()),
            _ => None,
        }
    }
}

impl<K, V> Structural for BTreeMap<K, V>
where
    K: Ord + Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: State,
{
    type Element = V;

    fn element_keys(&self) -> Vec<Segment> {
        self.keys()
            .map(|key| Segment::Key(ElementKey::new(key.clone())))
            .collect()
    }
    fn element_lens(key: &Segment) -> Option<Lens<Self, V>> {
        match key {
            Segment::Key(key) => Some(Lens::entry(key.downcast_ref::<K>()?.clone())),
            _ => None,
        }
    }
}

/// Elements added and removed between two values of a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StructuralDiff {
    /// In the order of the current value.
    pub added: Vec<Segment>,
    /// In the order of the previous value.
    pub removed: Vec<Segment>,
}

impl StructuralDiff {
    pub fn between<C: Structural>(previous: &C, current: &C) -> Self {
        Self::of_keys(&previous.element_keys(), &current.element_keys())
    }

    pub fn of_keys(previous: &[Segment], current: &[Segment]) -> Self {
        let before: HashSet<&Segment> = previous.iter().collect();
        let after: HashSet<&Segment> = current.iter().collect();
        Self {
            added: current
                .iter()
                .filter(|key| !before.contains(key))
                .cloned()
                .collect(),
            removed: previous
                .iter()
                .filter(|key| !after.contains(key))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub(crate) type Materialize = Arc<dyn Fn(&Segment) -> Option<NodeId> + Send + Sync>;
type Keys<T> = Box<dyn Fn(&T) -> Option<Vec<Segment>> + Send + Sync>;

/// Element tracking of one container, expressed over the value `T` it is registered on.
pub(crate) struct Tracker<T> {
    is_override: bool,
    keys: Keys<T>,
    materialize: Materialize,
}

impl<T: 'static> Tracker<T> {
    pub fn new(
        is_override: bool,
        keys: impl Fn(&T) -> Option<Vec<Segment>> + Send + Sync + 'static,
        materialize: Materialize,
    ) -> Self {
        Self {
            is_override,
            keys: Box::new(keys),
            materialize,
        }
    }

    pub fn through<P: 'static>(self, lens: Lens<P, T>) -> Tracker<P> {
        let keys = self.keys;
        Tracker {
            is_override: self.is_override,
            keys: Box::new(move |p: &P| lens.with(p, |c| c.and_then(|c| keys(c)))),
            materialize: self.materialize,
        }
    }
}

/// A tracker and the element nodes it currently holds.
pub(crate) struct TrackerEntry<S> {
    tracker: Tracker<S>,
    live: Vec<(Segment, NodeId)>,
}

impl<S> TrackerEntry<S> {
    pub fn new(tracker: Tracker<S>) -> Self {
        Self {
            tracker,
            live: Vec::new(),
        }
    }
    pub fn is_override(&self) -> bool {
        self.tracker.is_override
    }
    pub fn current_keys(&self, snapshot: &S) -> Vec<Segment> {
        (self.tracker.keys)(snapshot).unwrap_or_default()
    }
    pub fn live_keys(&self) -> Vec<Segment> {
        self.live.iter().map(|(key, _)| key.clone()).collect()
    }
    pub fn materializer(&self) -> Materialize {
        self.tracker.materialize.clone()
    }

    /// Stops holding the elements in `keys`; returns their nodes.
    pub fn forget(&mut self, keys: &[Segment]) -> Vec<NodeId> {
        let mut removed = Vec::new();
        self.live.retain(|(key, node)| {
            let keep = !keys.contains(key);
            if !keep {
                removed.push(*node);
            }
            keep
        });
        removed
    }
    pub fn record(&mut self, key: Segment, node: NodeId) {
        if !self.live.iter().any(|(k, _)| *k == key) {
            self.live.push((key, node));
        }
    }
    pub fn elements(&self) -> Vec<NodeId> {
        self.live.iter().map(|(_, node)| *node).collect()
    }
}

impl<C: Structural> Scope<C> {
    /// The element scope for `key`, `None` if `key` cannot identify an element.
    pub fn element(&self, key: &Segment) -> Option<Scope<C::Element>> {
        Some(self.scope(C::element_lens(key)?))
    }

    /// Identities of the current elements.
    pub fn element_keys(&self) -> Vec<Segment> {
        self.with(|c| c.map(|c| c.element_keys()).unwrap_or_default())
    }

    /// Scopes of the current elements, in order.
    pub fn elements(&self) -> Vec<Scope<C::Element>> {
        self.element_keys()
            .iter()
            .filter_map(|key| self.element(key))
            .collect()
    }

    /// Keeps one child scope per element alive.
    ///
    /// `on_element` runs when an element scope becomes active: for each current element now,
    /// then for elements that appear later. An element that disappears has its scope torn down
    /// while the change that removed it is delivered, which cancels everything registered under
    /// it. The container scope is kept active while tracking. Dropping the returned
    /// subscription stops tracking and releases the element scopes.
    pub fn track_elements(
        &self,
        on_element: impl Fn(&Scope<C::Element>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let node = self.node()?;
        let retain = self.retain()?;
        let on_element: Arc<dyn Fn(&Scope<C::Element>) + Send + Sync> = Arc::new(on_element);
        let container = self.clone();
        let materialize: Materialize = Arc::new(move |key: &Segment| {
            let element = container.element(key)?;
            let id = element.node().ok()?;
            let on_element = on_element.clone();
            let scope = element.clone();
            element
                .core()
                .hold_structural(id, Arc::new(move || on_element(&scope)))
                .then_some(id)
        });
        let tracker = Tracker::new(
            self.is_override(),
            |c: &C| Some(c.element_keys()),
            materialize,
        );
        let key = self
            .backend()
            .add_tracker(node, tracker)
            .ok_or_else(|| self.detached())?;
        let root = self.root_ops().clone();
        root.sync_tracker(node, key);
        let root = Arc::downgrade(&root);
        Ok(Subscription::from_fn(move || {
            if let Some(root) = root.upgrade() {
                for element in root.remove_tracker(node, key) {
                    root.core().release(element, Hold::Structural);
                }
            }
            drop(retain);
        }))
    }
}
