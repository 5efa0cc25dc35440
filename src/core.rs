use std::{
    collections::VecDeque,
    mem::{forget, replace},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use derive_ex::Ex;
use futures::{channel::mpsc::UnboundedSender, task::Spawn};
use serde::{Deserialize, Serialize};
use slabmap::SlabMap;

use crate::{
    Subscription,
    call_context::BatchContext,
    cancel::CancelKey,
    error::Result,
    observe::{Comparator, NodeObservations, Refresh, TrackKey},
    scope::{Backend, RootOps, Scope},
    structure::{StructuralDiff, Tracker},
    task::TaskFailure,
};

mod flush;
mod tree;

pub use tree::{AccessId, NodeId};
pub(crate) use tree::{BuildGuard, Hold, HookKind, Hook, Presence, Tree, TreeCore};

#[cfg(test)]
mod tests;

/// Values that can be held by a store or addressed by a scope.
pub trait State: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> State for T {}

/// When accumulated writes are published to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Publish once no write arrived for `poll_interval`, or `max_wait` after the first
    /// unpublished write, whichever comes first.
    Coalesce {
        poll_interval: Duration,
        max_wait: Duration,
    },
    /// Publish after every write.
    Immediate,
    /// Publish only on [`Store::flush`] (and before a write from another writer).
    Manual,
}

impl FlushPolicy {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(100);

    pub const fn coalesce() -> Self {
        Self::Coalesce {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_wait: Self::DEFAULT_MAX_WAIT,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::coalesce()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Ex)]
#[derive_ex(Default)]
#[default(Self::new())]
#[serde(default)]
pub struct StoreConfig {
    pub flush: FlushPolicy,
    /// Number of published snapshots kept by a [`Replay`](crate::replay::Replay).
    pub history_limit: usize,
}

impl StoreConfig {
    pub const fn new() -> Self {
        Self {
            flush: FlushPolicy::coalesce(),
            history_limit: 256,
        }
    }
}

/// One published transition of the state seen by the tree.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct StateChange<S> {
    pub previous: Arc<S>,
    pub current: Arc<S>,
    /// `current` is an override snapshot.
    pub is_overridden: bool,
    /// `previous` is an override snapshot.
    pub was_overridden: bool,
    /// Produced by [`Store::set_override`] or a write through an override scope.
    pub is_override_update: bool,
    pub batch: BatchContext,
    /// The node whose writes produced the change.
    pub origin: Option<NodeId>,
}

impl<S> StateChange<S> {
    /// Entering or leaving override mode.
    pub fn is_override_transition(&self) -> bool {
        self.is_overridden != self.was_overridden
    }
}

impl<S> std::fmt::Debug for StateChange<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChange")
            .field("is_overridden", &self.is_overridden)
            .field("was_overridden", &self.was_overridden)
            .field("is_override_update", &self.is_override_update)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

pub(crate) struct WriteOrigin {
    pub node: NodeId,
    pub batch: BatchContext,
    pub is_override: bool,
}

struct Pending {
    writer: NodeId,
    batch: BatchContext,
    started: Instant,
    last_write: Instant,
}

struct SnapshotCell<S> {
    live: Arc<S>,
    published: Arc<S>,
    overridden: Option<Arc<S>>,
    pending: Option<Pending>,
}

struct Deliveries<S> {
    queue: VecDeque<StateChange<S>>,
    draining: bool,
}

type Tap<S> = Arc<dyn Fn(&StateChange<S>) + Send + Sync>;

/// The typed half of a store: snapshots, write path and notification delivery.
///
/// Lock order is `cell` → `deliveries`; neither is held while the tree is walked.
pub(crate) struct RootShared<S> {
    core: Arc<TreeCore>,
    config: StoreConfig,
    cell: Mutex<SnapshotCell<S>>,
    deliveries: Mutex<Deliveries<S>>,
    taps: Mutex<SlabMap<Tap<S>>>,
    flush_wakeup: Mutex<Option<UnboundedSender<()>>>,
}

impl<S: State> RootShared<S> {
    fn new(state: S, config: StoreConfig, core: Arc<TreeCore>) -> Arc<Self> {
        let state = Arc::new(state);
        Arc::new(Self {
            core,
            config,
            cell: Mutex::new(SnapshotCell {
                live: state.clone(),
                published: state,
                overridden: None,
                pending: None,
            }),
            deliveries: Mutex::new(Deliveries {
                queue: VecDeque::new(),
                draining: false,
            }),
            taps: Mutex::new(SlabMap::new()),
            flush_wakeup: Mutex::new(None),
        })
    }

    fn cell(&self) -> MutexGuard<'_, SnapshotCell<S>> {
        self.cell.lock().unwrap()
    }

    pub fn core(&self) -> &Arc<TreeCore> {
        &self.core
    }

    /// The snapshot every read sees: the override if one is active, otherwise the live state
    /// including unpublished writes.
    pub fn effective(&self) -> Arc<S> {
        let cell = self.cell();
        cell.overridden.clone().unwrap_or_else(|| cell.live.clone())
    }
    pub fn live(&self) -> Arc<S> {
        self.cell().live.clone()
    }
    pub fn published(&self) -> Arc<S> {
        self.cell().published.clone()
    }
    pub fn is_overridden(&self) -> bool {
        self.cell().overridden.is_some()
    }
    pub fn has_pending(&self) -> bool {
        self.cell().pending.is_some()
    }

    fn enqueue(&self, change: StateChange<S>) {
        self.deliveries.lock().unwrap().queue.push_back(change);
    }

    fn publish(&self, cell: &mut SnapshotCell<S>) {
        let Some(pending) = cell.pending.take() else {
            return;
        };
        if Arc::ptr_eq(&cell.published, &cell.live) {
            return;
        }
        tracing::trace!(writer = %pending.writer, "publishing state change");
        let previous = replace(&mut cell.published, cell.live.clone());
        self.enqueue(StateChange {
            previous,
            current: cell.live.clone(),
            is_overridden: false,
            was_overridden: false,
            is_override_update: false,
            batch: pending.batch,
            origin: Some(pending.writer),
        });
    }

    pub fn flush(&self) {
        {
            let mut cell = self.cell();
            self.publish(&mut cell);
        }
        self.drain();
    }

    /// Time left before the pending batch must be published, `None` if nothing is pending.
    pub(crate) fn flush_due(
        &self,
        now: Instant,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Option<Duration> {
        let cell = self.cell();
        let pending = cell.pending.as_ref()?;
        let due = (pending.last_write + poll_interval).min(pending.started + max_wait);
        Some(due.saturating_duration_since(now))
    }

    pub fn set_override(&self, snapshot: Option<Arc<S>>) {
        {
            let mut cell = self.cell();
            self.publish(&mut cell);
            let previous = cell.overridden.clone();
            match (snapshot, previous) {
                (None, None) => {}
                (Some(next), Some(previous)) if Arc::ptr_eq(&next, &previous) => {}
                (Some(next), previous) => {
                    tracing::debug!("override set");
                    cell.overridden = Some(next.clone());
                    self.enqueue(StateChange {
                        was_overridden: previous.is_some(),
                        previous: previous.unwrap_or_else(|| cell.live.clone()),
                        current: next,
                        is_overridden: true,
                        is_override_update: true,
                        batch: BatchContext::new(),
                        origin: None,
                    });
                }
                (None, Some(previous)) => {
                    tracing::debug!("override cleared");
                    cell.overridden = None;
                    self.enqueue(StateChange {
                        previous,
                        current: cell.live.clone(),
                        is_overridden: false,
                        was_overridden: true,
                        is_override_update: true,
                        batch: BatchContext::new(),
                        origin: None,
                    });
                }
            }
        }
        self.drain();
    }

    fn wake_flush_loop(&self) {
        let sent = match &*self.flush_wakeup.lock().unwrap() {
            Some(tx) => tx.unbounded_send(()).is_ok(),
            None => false,
        };
        if !sent {
            self.flush();
        }
    }

    /// Delivers queued changes in order. Only one thread drains at a time; a change queued
    /// while another thread drains is delivered by that thread.
    fn drain(&self) {
        {
            let mut deliveries = self.deliveries.lock().unwrap();
            if deliveries.draining {
                return;
            }
            deliveries.draining = true;
        }
        let guard = DrainGuard(&self.deliveries);
        loop {
            let change = {
                let mut deliveries = self.deliveries.lock().unwrap();
                match deliveries.queue.pop_front() {
                    Some(change) => change,
                    None => {
                        deliveries.draining = false;
                        break;
                    }
                }
            };
            self.process(&change);
        }
        forget(guard);
    }

    fn process(&self, change: &StateChange<S>) {
        let taps: Vec<Tap<S>> = self.taps.lock().unwrap().values().cloned().collect();
        for tap in taps {
            tap(change);
        }
        let (refreshes, trackers) = {
            let tree = self.core.tree();
            let mut refreshes = Vec::new();
            let mut trackers = Vec::new();
            for id in tree.preorder() {
                let Some(observations) = tree
                    .get(id)
                    .and_then(|n| n.observation.as_ref())
                    .and_then(|o| o.downcast_ref::<NodeObservations<S>>())
                else {
                    continue;
                };
                let from_descendant = change
                    .origin
                    .is_some_and(|origin| tree.is_strict_descendant(origin, id));
                observations.collect_refreshes(change, from_descendant, &mut refreshes);
                for key in observations.trackers_to_sync(change) {
                    trackers.push((id, key));
                }
            }
            (refreshes, trackers)
        };
        for (node, key) in trackers {
            self.sync_tracker_with(node, key, &change.current);
        }
        let pruned = self.core.prune(!change.is_overridden);
        if pruned > 0 {
            tracing::trace!(pruned, "inactive scopes removed");
        }
        run_refreshes(&change.batch, refreshes);
    }

    fn observations<'a>(tree: &'a mut Tree, node: NodeId) -> Option<&'a mut NodeObservations<S>> {
        tree.get_mut(node)?
            .observation
            .get_or_insert_with(|| Box::new(NodeObservations::<S>::new()))
            .downcast_mut()
    }

    fn sync_tracker_with(&self, node: NodeId, key: usize, snapshot: &S) {
        let (added, removed, materialize) = {
            let mut tree = self.core.tree();
            let Some(entry) = Self::observations(&mut tree, node).and_then(|o| o.tracker_mut(key))
            else {
                return;
            };
            let current = entry.current_keys(snapshot);
            let diff = StructuralDiff::of_keys(&entry.live_keys(), &current);
            let removed = entry.forget(&diff.removed);
            (diff.added, removed, entry.materializer())
        };
        for element in removed {
            self.core.teardown(element);
        }
        for segment in added {
            let Some(element) = materialize(&segment) else {
                continue;
            };
            let mut tree = self.core.tree();
            if let Some(entry) =
                Self::observations(&mut tree, node).and_then(|o| o.tracker_mut(key))
            {
                entry.record(segment, element);
            }
        }
    }

    fn shutdown(&self) {
        self.flush_wakeup.lock().unwrap().take();
        let taps = std::mem::take(&mut *self.taps.lock().unwrap());
        drop(taps);
        self.core.shutdown();
    }
}

struct DrainGuard<'a, S>(&'a Mutex<Deliveries<S>>);

impl<S> Drop for DrainGuard<'_, S> {
    fn drop(&mut self) {
        if let Ok(mut deliveries) = self.0.lock() {
            deliveries.draining = false;
        }
    }
}

fn run_refreshes(batch: &BatchContext, refreshes: Vec<Refresh>) {
    if refreshes.is_empty() {
        return;
    }
    batch.run(|| {
        for refresh in refreshes {
            refresh();
        }
    });
}

impl<S: State> Backend<S> for RootShared<S> {
    fn with(&self, f: &mut dyn FnMut(Option<&S>)) {
        let snapshot = self.effective();
        f(Some(&snapshot))
    }

    fn write(&self, origin: &WriteOrigin, f: &mut dyn FnMut(&mut S)) -> Result<bool> {
        if self.core.is_building() {
            panic!("state was mutated while a model was being built");
        }
        let mut start_batch = false;
        let mut overridden = false;
        {
            let mut cell = self.cell();
            if let Some(snapshot) = &mut cell.overridden {
                overridden = true;
                if !origin.is_override {
                    tracing::debug!(writer = %origin.node, "write dropped while an override is active");
                    return Ok(false);
                }
                let previous = snapshot.clone();
                f(Arc::make_mut(snapshot));
                let current = snapshot.clone();
                self.enqueue(StateChange {
                    previous,
                    current,
                    is_overridden: true,
                    was_overridden: true,
                    is_override_update: true,
                    batch: origin.batch.clone(),
                    origin: Some(origin.node),
                });
            } else {
                if let Some(pending) = &cell.pending
                    && (pending.writer != origin.node || pending.batch != origin.batch)
                {
                    self.publish(&mut cell);
                }
                f(Arc::make_mut(&mut cell.live));
                let now = Instant::now();
                match &mut cell.pending {
                    Some(pending) => pending.last_write = now,
                    None => {
                        cell.pending = Some(Pending {
                            writer: origin.node,
                            batch: origin.batch.clone(),
                            started: now,
                            last_write: now,
                        });
                        start_batch = true;
                    }
                }
            }
        }
        self.drain();
        if !overridden {
            match self.config.flush {
                FlushPolicy::Immediate => self.flush(),
                FlushPolicy::Coalesce { .. } if start_batch => self.wake_flush_loop(),
                FlushPolicy::Coalesce { .. } | FlushPolicy::Manual => {}
            }
        }
        Ok(true)
    }

    fn track(&self, node: NodeId, observer: usize, key: TrackKey, comparator: Comparator<S>) {
        let mut tree = self.core.tree();
        if let Some(observations) = Self::observations(&mut tree, node) {
            observations.track(observer, key, comparator);
        }
    }

    fn add_tracker(&self, node: NodeId, tracker: Tracker<S>) -> Option<usize> {
        let mut tree = self.core.tree();
        Some(Self::observations(&mut tree, node)?.add_tracker(tracker))
    }
}

impl<S: State> RootOps for RootShared<S> {
    fn core(&self) -> &Arc<TreeCore> {
        &self.core
    }
    fn flush(&self) {
        RootShared::flush(self)
    }

    fn insert_observer(&self, node: NodeId, is_override: bool, on_refresh: Refresh) -> Option<usize> {
        let mut tree = self.core.tree();
        Some(Self::observations(&mut tree, node)?.insert_observer(is_override, on_refresh))
    }
    fn remove_observer(&self, node: NodeId, key: usize) {
        let removed = {
            let mut tree = self.core.tree();
            Self::observations(&mut tree, node).and_then(|o| o.remove_observer(key))
        };
        drop(removed);
    }
    fn reset_observer(&self, node: NodeId, key: usize) {
        let removed = {
            let mut tree = self.core.tree();
            Self::observations(&mut tree, node).map(|o| o.reset_observer(key))
        };
        drop(removed);
    }

    fn remove_tracker(&self, node: NodeId, key: usize) -> Vec<NodeId> {
        let removed = {
            let mut tree = self.core.tree();
            Self::observations(&mut tree, node).and_then(|o| o.remove_tracker(key))
        };
        removed.map(|entry| entry.elements()).unwrap_or_default()
    }
    fn sync_tracker(&self, node: NodeId, key: usize) {
        let is_override = {
            let mut tree = self.core.tree();
            let Some(entry) = Self::observations(&mut tree, node).and_then(|o| o.tracker_mut(key))
            else {
                return;
            };
            entry.is_override()
        };
        let snapshot = if is_override {
            self.effective()
        } else {
            self.published()
        };
        self.sync_tracker_with(node, key, &snapshot);
    }
}

/// Owner of a state tree.
///
/// Dropping the store cancels every registered cancellable and removes every scope node;
/// handles that outlive it report [`Error::StoreDropped`](crate::Error::StoreDropped).
pub struct Store<S: State> {
    shared: Arc<RootShared<S>>,
}

impl<S: State> Store<S> {
    pub fn new(state: S) -> Self {
        Self::builder(state).build()
    }
    pub fn builder(state: S) -> StoreBuilder<S> {
        StoreBuilder::new(state)
    }

    pub(crate) fn shared(&self) -> &Arc<RootShared<S>> {
        &self.shared
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// The root scope.
    pub fn scope(&self) -> Scope<S> {
        Scope::root(self.shared.clone(), false)
    }

    /// The root scope of the override tree.
    ///
    /// Writes made through it, or through scopes reached from it, modify the override snapshot
    /// while one is active and the live state otherwise.
    pub fn override_scope(&self) -> Scope<S> {
        Scope::root(self.shared.clone(), true)
    }

    /// The snapshot reads currently see.
    pub fn state(&self) -> Arc<S> {
        self.shared.effective()
    }
    /// The live state, including writes that are not published yet.
    pub fn live_state(&self) -> Arc<S> {
        self.shared.live()
    }
    /// The live state as of the last published change.
    pub fn published_state(&self) -> Arc<S> {
        self.shared.published()
    }
    pub fn has_pending_writes(&self) -> bool {
        self.shared.has_pending()
    }

    /// Publishes pending writes now.
    pub fn flush(&self) {
        self.shared.flush()
    }

    /// Replaces the state seen by every read with `state`, or restores the live state with
    /// `None`. Pending writes are published first.
    pub fn set_override(&self, state: Option<S>) {
        self.shared.set_override(state.map(Arc::new))
    }
    /// Like [`set_override`](Self::set_override), reusing an existing snapshot.
    pub fn set_override_snapshot(&self, snapshot: Option<Arc<S>>) {
        self.shared.set_override(snapshot)
    }
    pub fn is_overridden(&self) -> bool {
        self.shared.is_overridden()
    }

    /// Calls `f` with every change delivered to the tree, before any observer runs.
    pub fn subscribe(&self, f: impl Fn(&StateChange<S>) + Send + Sync + 'static) -> Subscription {
        let key = self.shared.taps.lock().unwrap().insert(Arc::new(f));
        Subscription::from_weak_fn(Arc::downgrade(&self.shared), move |shared| {
            let tap = shared.taps.lock().unwrap().remove(key);
            drop(tap);
        })
    }

    /// Cancels everything registered under `key` anywhere in the tree.
    pub fn cancel_all(&self, key: &CancelKey) -> usize {
        self.shared.core.cancel_key(key)
    }
    /// Number of cancellables (including running tasks) registered in the tree.
    pub fn pending_tasks(&self) -> usize {
        self.shared.core.pending()
    }
}

impl<S: State> Drop for Store<S> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

pub struct StoreBuilder<S> {
    state: S,
    config: StoreConfig,
    spawner: Option<Arc<dyn Spawn + Send + Sync>>,
    on_task_failure: Option<tree::FailureHandler>,
}

impl<S: State> StoreBuilder<S> {
    fn new(state: S) -> Self {
        Self {
            state,
            config: StoreConfig::default(),
            spawner: None,
            on_task_failure: None,
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }
    pub fn flush_policy(mut self, flush: FlushPolicy) -> Self {
        self.config.flush = flush;
        self
    }

    /// Runs tasks and the flush loop on `spawner` instead of the shared thread pool.
    pub fn spawner(mut self, spawner: impl Spawn + Send + Sync + 'static) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Receives the errors of failed tasks. Defaults to logging them.
    pub fn on_task_failure(mut self, f: impl Fn(&TaskFailure) + Send + Sync + 'static) -> Self {
        self.on_task_failure = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Store<S> {
        let core = TreeCore::new(
            self.spawner,
            self.on_task_failure
                .unwrap_or_else(tree::default_failure_handler),
        );
        let shared = RootShared::new(self.state, self.config, core);
        if let FlushPolicy::Coalesce {
            poll_interval,
            max_wait,
        } = shared.config.flush
        {
            let wakeup = flush::start(&shared, poll_interval, max_wait);
            *shared.flush_wakeup.lock().unwrap() = wakeup;
        }
        Store { shared }
    }
}
