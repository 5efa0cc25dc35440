//! Dependency-tracked observation of scopes.
//!
//! An [`Observer`] records a comparator for every path it reads. On each state change the
//! comparators run against the previous and current snapshots, and the observer's callback runs
//! once if any of them reports a difference.

use std::{collections::HashMap, sync::Arc};

use slabmap::SlabMap;

use crate::{
    Subscription,
    core::{NodeId, State, StateChange},
    error::Result,
    lens::{Lens, LensId, Segment},
    scope::Scope,
    structure::{Structural, Tracker, TrackerEntry},
};


pub(crate) type Refresh = Arc<dyn Fn() + Send + Sync>;

type Changed<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Decides whether the value at one path differs between two snapshots.
pub(crate) struct Comparator<T> {
    ignore_child_updates: bool,
    changed: Changed<T>,
}

impl<T: 'static> Comparator<T> {
    pub fn new(ignore_child_updates: bool, changed: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            ignore_child_updates,
            changed: Box::new(changed),
        }
    }

    pub fn value() -> Self
    where
        T: PartialEq,
    {
        Self::new(false, |a: &T, b: &T| a != b)
    }

    /// Compares only the element identities; updates coming from descendants are skipped.
    pub fn structure() -> Self
    where
        T: Structural,
    {
        Self::new(true, |a: &T, b: &T| a.element_keys() != b.element_keys())
    }

    /// The same comparison applied to the value `lens` reaches. A value that exists in only one
    /// of the snapshots is a difference.
    pub fn through<P: 'static>(self, lens: Lens<P, T>) -> Comparator<P> {
        let Comparator {
            ignore_child_updates,
            changed,
        } = self;
        Comparator {
            ignore_child_updates,
            changed: Box::new(move |a: &P, b: &P| {
                lens.with(a, |a| {
                    lens.with(b, |b| match (a, b) {
                        (Some(a), Some(b)) => changed(a, b),
                        (None, None) => false,
                        _ => true,
                    })
                })
            }),
        }
    }

    fn is_changed(&self, previous: &T, current: &T, from_descendant: bool) -> bool {
        if self.ignore_child_updates && from_descendant {
            return false;
        }
        (self.changed)(previous, current)
    }
}

/// What an observer tracked: a path, and whether only the element identities there matter.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct TrackKey {
    pub path: LensId,
    pub ids_only: bool,
}

pub(crate) struct ObserverEntry<S> {
    is_override: bool,
    on_refresh: Refresh,
    comparators: HashMap<TrackKey, Comparator<S>>,
}

impl<S: 'static> ObserverEntry<S> {
    fn should_refresh(&self, change: &StateChange<S>, from_descendant: bool) -> bool {
        if change.is_override_transition() {
            return true;
        }
        if change.is_override_update && !self.is_override {
            return false;
        }
        self.comparators
            .values()
            .any(|c| c.is_changed(&change.previous, &change.current, from_descendant))
    }
}

/// Observers and element trackers attached to one node, typed by the store's state.
pub(crate) struct NodeObservations<S> {
    observers: SlabMap<ObserverEntry<S>>,
    trackers: SlabMap<TrackerEntry<S>>,
}

impl<S: 'static> NodeObservations<S> {
    pub fn new() -> Self {
        Self {
            observers: SlabMap::new(),
            trackers: SlabMap::new(),
        }
    }

    pub fn insert_observer(&mut self, is_override: bool, on_refresh: Refresh) -> usize {
        self.observers.insert(ObserverEntry {
            is_override,
            on_refresh,
            comparators: HashMap::new(),
        })
    }
    pub fn remove_observer(&mut self, key: usize) -> Option<ObserverEntry<S>> {
        self.observers.remove(key)
    }
    pub fn reset_observer(&mut self, key: usize) -> Option<HashMap<TrackKey, Comparator<S>>> {
        self.observers
            .get_mut(key)
            .map(|entry| std::mem::take(&mut entry.comparators))
    }

    /// Records `comparator` unless `key` is already tracked.
    pub fn track(&mut self, observer: usize, key: TrackKey, comparator: Comparator<S>) {
        if let Some(entry) = self.observers.get_mut(observer) {
            entry.comparators.entry(key).or_insert(comparator);
        }
    }

    pub fn collect_refreshes(
        &self,
        change: &StateChange<S>,
        from_descendant: bool,
        to: &mut Vec<Refresh>,
    ) {
        for (_, entry) in self.observers.iter() {
            if entry.should_refresh(change, from_descendant) {
                to.push(entry.on_refresh.clone());
            }
        }
    }

    pub fn add_tracker(&mut self, tracker: Tracker<S>) -> usize {
        self.trackers.insert(TrackerEntry::new(tracker))
    }
    pub fn tracker_mut(&mut self, key: usize) -> Option<&mut TrackerEntry<S>> {
        self.trackers.get_mut(key)
    }
    pub fn remove_tracker(&mut self, key: usize) -> Option<TrackerEntry<S>> {
        self.trackers.remove(key)
    }

    /// Trackers that must diff their container for `change`.
    ///
    /// Live trackers ignore override updates.
    pub fn trackers_to_sync(&self, change: &StateChange<S>) -> Vec<usize> {
        self.trackers
            .iter()
            .filter(|(_, entry)| entry.is_override() || !change.is_override_update)
            .map(|(key, _)| key)
            .collect()
    }
}

/// Observation handle of a scope.
///
/// Every read made through the observer is tracked; `on_refresh` runs when a tracked value
/// changes. The scope stays active while the observer is alive.
pub struct Observer<T: State> {
    scope: Scope<T>,
    node: NodeId,
    key: usize,
    _retain: Subscription,
}

impl<T: State> Scope<T> {
    /// Attaches an observer calling `on_refresh` once per state change that affects a value it
    /// read.
    pub fn observe(&self, on_refresh: impl Fn() + Send + Sync + 'static) -> Result<Observer<T>> {
        let node = self.node()?;
        let key = self
            .root_ops()
            .insert_observer(node, self.is_override(), Arc::new(on_refresh))
            .ok_or_else(|| self.detached())?;
        let retain = match self.retain() {
            Ok(retain) => retain,
            Err(e) => {
                self.root_ops().remove_observer(node, key);
                return Err(e);
            }
        };
        Ok(Observer {
            scope: self.clone(),
            node,
            key,
            _retain: retain,
        })
    }
}

impl<T: State> Observer<T> {
    pub fn scope(&self) -> &Scope<T> {
        &self.scope
    }
    pub fn node(&self) -> NodeId {
        self.node
    }

    fn track(&self, path: LensId, ids_only: bool, comparator: Comparator<T>) {
        self.scope
            .backend()
            .track(self.node, self.key, TrackKey { path, ids_only }, comparator);
    }

    /// Reads the whole value and tracks it.
    pub fn get(&self) -> T
    where
        T: PartialEq,
    {
        self.track(LensId::root(), false, Comparator::value());
        self.scope.get()
    }
    pub fn try_get(&self) -> Option<T>
    where
        T: PartialEq,
    {
        self.track(LensId::root(), false, Comparator::value());
        self.scope.try_get()
    }

    /// Reads the value `lens` reaches and tracks only that path.
    pub fn read<C: State + PartialEq>(&self, lens: &Lens<T, C>) -> Option<C> {
        self.track(
            lens.id().clone(),
            false,
            Comparator::value().through(lens.clone()),
        );
        self.scope.read(lens)
    }

    /// Reads the element identities of the container `lens` reaches.
    ///
    /// Only adding, removing or reordering elements refreshes the observer; changes inside an
    /// element do not.
    pub fn read_ids<C: Structural>(&self, lens: &Lens<T, C>) -> Vec<Segment> {
        self.track(
            lens.id().clone(),
            true,
            Comparator::structure().through(lens.clone()),
        );
        self.scope
            .with(|value| value.and_then(|v| lens.with(v, |c| c.map(|c| c.element_keys()))))
            .unwrap_or_default()
    }

    /// Element identities of the observed container.
    pub fn ids(&self) -> Vec<Segment>
    where
        T: Structural,
    {
        self.read_ids(&Lens::identity())
    }

    /// Forgets every tracked path.
    pub fn reset(&self) {
        self.scope.root_ops().reset_observer(self.node, self.key);
    }
}

impl<T: State> Drop for Observer<T> {
    fn drop(&mut self) {
        self.scope.root_ops().remove_observer(self.node, self.key);
    }
}
