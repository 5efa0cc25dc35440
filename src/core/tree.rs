use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc, LazyLock, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use futures::{
    executor::ThreadPool,
    task::{Spawn, SpawnExt},
};
use parse_display::Display;
use slabmap::SlabMap;

use crate::{
    cancel::{CancelId, CancelKey, Cancellable, CancellationRegistry, LifecycleId, run_all},
    error::{Error, Result},
    event::{Broadcast, Event, EventReceiver, Receivers},
    lens::LensId,
    task::TaskFailure,
};

pub(crate) type Hook = Arc<dyn Fn() + Send + Sync>;
pub(crate) type FailureHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

/// Address of a scope node in the store's arena.
///
/// Ids are never reused: a node created in a slot freed by a torn-down node gets a new
/// generation, so lookups through an old id fail instead of reaching the new node.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("node#{index}.{generation}")]
pub struct NodeId {
    index: usize,
    generation: u64,
}

/// Identity of one logical call site that materializes models.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("access#{0}")]
pub struct AccessId(u64);

impl AccessId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Tells whether the value a node addresses still exists.
pub(crate) trait Presence: Send + Sync {
    fn exists(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HookKind {
    Activate,
    Deactivate,
}

/// Why a node is kept active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Hold {
    /// Counted; the first one also retains the parent.
    Observer,
    /// Held by the container that materialized the node; does not retain the parent.
    Structural,
}

/// Hooks registered through scope handles, keyed by node path and tree.
///
/// They outlive the node, so a node recreated at the same path gets them back.
type ScopeHooks = HashMap<(LensId, bool), SlabMap<(HookKind, Hook)>>;

/// Handle to a hook added with [`TreeCore::add_scope_hook`].
pub(crate) struct ScopeHookKey {
    site: (LensId, bool),
    key: usize,
}

struct ModelEntry {
    owner: Weak<AccessId>,
    model: Arc<dyn Any + Send + Sync>,
}

pub(crate) struct Node {
    generation: u64,
    pub parent: Option<NodeId>,
    pub path: LensId,
    pub is_override: bool,
    children: HashMap<LensId, NodeId>,
    override_children: HashMap<LensId, NodeId>,
    pub lifecycle: LifecycleId,
    observers: usize,
    structural_hold: bool,
    on_activate: SlabMap<Hook>,
    on_deactivate: SlabMap<Hook>,
    events: Broadcast,
    handles: [Option<Box<dyn Any + Send + Sync>>; 2],
    presence: Option<Weak<dyn Presence>>,
    models: HashMap<(AccessId, TypeId), ModelEntry>,
    model_types: HashSet<TypeId>,
    pub observation: Option<Box<dyn Any + Send + Sync>>,
}

impl Node {
    pub fn is_active(&self) -> bool {
        self.observers > 0 || self.structural_hold
    }
    fn hooks(&self, kind: HookKind) -> &SlabMap<Hook> {
        match kind {
            HookKind::Activate => &self.on_activate,
            HookKind::Deactivate => &self.on_deactivate,
        }
    }
    fn hooks_mut(&mut self, kind: HookKind) -> &mut SlabMap<Hook> {
        match kind {
            HookKind::Activate => &mut self.on_activate,
            HookKind::Deactivate => &mut self.on_deactivate,
        }
    }
    fn site(&self) -> (LensId, bool) {
        (self.path.clone(), self.is_override)
    }
}

pub(crate) struct Tree {
    nodes: SlabMap<Node>,
    root: Option<NodeId>,
    next_generation: u64,
    scope_hooks: ScopeHooks,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self {
            nodes: SlabMap::new(),
            root: None,
            next_generation: 0,
            scope_hooks: HashMap::new(),
        };
        tree.root = Some(tree.insert(None, LensId::root(), false));
        tree
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .get(id.index)
            .filter(|node| node.generation == id.generation)
    }
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(id.index)
            .filter(|node| node.generation == id.generation)
    }

    fn insert(&mut self, parent: Option<NodeId>, path: LensId, is_override: bool) -> NodeId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.nodes.insert(Node {
            generation,
            parent,
            path,
            is_override,
            children: HashMap::new(),
            override_children: HashMap::new(),
            lifecycle: LifecycleId::next(),
            observers: 0,
            structural_hold: false,
            on_activate: SlabMap::new(),
            on_deactivate: SlabMap::new(),
            events: Broadcast::default(),
            handles: [None, None],
            presence: None,
            models: HashMap::new(),
            model_types: HashSet::new(),
            observation: None,
        });
        NodeId { index, generation }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn collect_hooks(&self, id: NodeId, kind: HookKind, hooks: &mut Vec<Hook>) {
        let Some(node) = self.get(id) else {
            return;
        };
        hooks.extend(node.hooks(kind).values().cloned());
        if let Some(table) = self.scope_hooks.get(&node.site()) {
            hooks.extend(
                table
                    .values()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, hook)| hook.clone()),
            );
        }
    }

    /// Children in creation order, live children first.
    fn children(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        let mut live: Vec<NodeId> = node.children.values().copied().collect();
        let mut overridden: Vec<NodeId> = node.override_children.values().copied().collect();
        live.sort_by_key(|id| id.generation);
        overridden.sort_by_key(|id| id.generation);
        live.extend(overridden);
        live.retain(|&id| self.get(id).is_some());
        live
    }

    /// `id` followed by its descendants, ancestors before descendants.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if self.get(id).is_none() {
                continue;
            }
            nodes.push(id);
            let mut children = self.children(id);
            children.reverse();
            stack.extend(children);
        }
        nodes
    }

    /// Every node, ancestors first.
    pub fn preorder(&self) -> Vec<NodeId> {
        self.root.map(|root| self.subtree(root)).unwrap_or_default()
    }

    pub fn is_strict_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.get(node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).and_then(|n| n.parent);
        }
        false
    }

    fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent);
        while let Some(id) = current {
            ancestors.push(id);
            current = self.get(id).and_then(|n| n.parent);
        }
        ancestors
    }

    fn retain(&mut self, id: NodeId, hold: Hold, activated: &mut Vec<NodeId>) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        let was_active = node.is_active();
        let propagate = match hold {
            Hold::Observer => {
                node.observers += 1;
                node.observers == 1
            }
            Hold::Structural => {
                node.structural_hold = true;
                false
            }
        };
        let parent = node.parent;
        if propagate && let Some(parent) = parent {
            self.retain(parent, Hold::Observer, activated);
        }
        if !was_active {
            activated.push(id);
        }
        true
    }

    /// Detaches the subtree of `id` from the arena and from its parent's child table.
    fn remove_subtree(&mut self, id: NodeId) -> Vec<Node> {
        let nodes = self.subtree(id);
        if let Some(parent) = self.get(id).and_then(|n| n.parent)
            && let Some(parent) = self.get_mut(parent)
        {
            parent.children.retain(|_, child| *child != id);
            parent.override_children.retain(|_, child| *child != id);
        }
        nodes
            .into_iter()
            .filter_map(|id| self.nodes.remove(id.index))
            .collect()
    }
}

static DEFAULT_POOL: LazyLock<Result<ThreadPool, String>> = LazyLock::new(|| {
    ThreadPool::builder()
        .name_prefix("statetree-")
        .create()
        .map_err(|e| e.to_string())
});

/// The part of a store that does not depend on the state type: the node arena, the
/// cancellation registry and the task spawner.
///
/// Locks are never nested except `tree` → `registry`, and user callbacks run only after every
/// lock is released.
pub(crate) struct TreeCore {
    tree: Mutex<Tree>,
    registry: Mutex<CancellationRegistry>,
    building: Mutex<HashMap<ThreadId, usize>>,
    spawner: Option<Arc<dyn Spawn + Send + Sync>>,
    failure_handler: FailureHandler,
}

impl TreeCore {
    pub fn new(
        spawner: Option<Arc<dyn Spawn + Send + Sync>>,
        failure_handler: FailureHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(Tree::new()),
            registry: Mutex::new(CancellationRegistry::new()),
            building: Mutex::new(HashMap::new()),
            spawner,
            failure_handler,
        })
    }

    pub fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap()
    }
    fn registry(&self) -> MutexGuard<'_, CancellationRegistry> {
        self.registry.lock().unwrap()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.tree().root()
    }
    pub fn contains(&self, id: NodeId) -> bool {
        self.tree().get(id).is_some()
    }
    pub fn path(&self, id: NodeId) -> Option<LensId> {
        self.tree().get(id).map(|n| n.path.clone())
    }
    pub fn lifecycle(&self, id: NodeId) -> Option<LifecycleId> {
        self.tree().get(id).map(|n| n.lifecycle)
    }
    pub fn is_active(&self, id: NodeId) -> bool {
        self.tree().get(id).is_some_and(|n| n.is_active())
    }

    /// Finds or creates the child of `parent` reached by `key`.
    pub fn child(&self, parent: NodeId, key: &LensId, is_override: bool) -> Option<NodeId> {
        let mut tree = self.tree();
        let node = tree.get(parent)?;
        let table = if is_override {
            &node.override_children
        } else {
            &node.children
        };
        if let Some(&id) = table.get(key)
            && tree.get(id).is_some()
        {
            return Some(id);
        }
        let path = node.path.join(key);
        let child_is_override = is_override || node.is_override;
        let id = tree.insert(Some(parent), path, child_is_override);
        let node = tree.get_mut(parent)?;
        let table = if is_override {
            &mut node.override_children
        } else {
            &mut node.children
        };
        table.insert(key.clone(), id);
        Some(id)
    }

    pub fn handle<H: Any + Clone>(&self, id: NodeId, is_override: bool) -> Option<H> {
        let tree = self.tree();
        let handle = tree.get(id)?.handles[is_override as usize].as_ref()?;
        handle.downcast_ref::<H>().cloned()
    }
    pub fn set_handle<H: Any + Send + Sync>(
        &self,
        id: NodeId,
        is_override: bool,
        handle: H,
        presence: Weak<dyn Presence>,
    ) {
        if let Some(node) = self.tree().get_mut(id) {
            node.handles[is_override as usize] = Some(Box::new(handle));
            node.presence = Some(presence);
        }
    }
    pub fn node_count(&self) -> usize {
        self.tree().len()
    }

    pub fn retain(&self, id: NodeId, hold: Hold) -> bool {
        let hooks = {
            let mut tree = self.tree();
            let mut activated = Vec::new();
            if !tree.retain(id, hold, &mut activated) {
                return false;
            }
            let mut hooks = Vec::new();
            for id in activated {
                if let Some(node) = tree.get(id) {
                    tracing::debug!(path = %node.path, "scope activated");
                }
                tree.collect_hooks(id, HookKind::Activate, &mut hooks);
            }
            hooks
        };
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn release(&self, id: NodeId, hold: Hold) {
        let mut next = Some(id);
        let mut hold = hold;
        while let Some(id) = next.take() {
            let (deactivate, parent) = {
                let mut tree = self.tree();
                let Some(node) = tree.get_mut(id) else {
                    return;
                };
                let propagate = match hold {
                    Hold::Observer => {
                        if node.observers == 0 {
                            return;
                        }
                        node.observers -= 1;
                        node.observers == 0
                    }
                    Hold::Structural => {
                        if !node.structural_hold {
                            return;
                        }
                        node.structural_hold = false;
                        false
                    }
                };
                let parent = if propagate { node.parent } else { None };
                (!node.is_active(), parent)
            };
            if deactivate {
                self.deactivate(id);
            }
            next = parent;
            hold = Hold::Observer;
        }
    }

    fn deactivate(&self, id: NodeId) {
        if self.root() != Some(id) {
            self.tear_down(id, true);
            return;
        }
        let (lifecycle, hooks) = {
            let tree = self.tree();
            let Some(node) = tree.get(id) else {
                return;
            };
            let lifecycle = node.lifecycle;
            let mut hooks = Vec::new();
            tree.collect_hooks(id, HookKind::Deactivate, &mut hooks);
            (lifecycle, hooks)
        };
        let cancellables = self.registry().cancel_owner(lifecycle);
        run_all(cancellables);
        tracing::debug!(path = %LensId::root(), "scope deactivated");
        for hook in hooks {
            hook();
        }
    }

    /// Cancels everything registered under the subtree of `id`, fires the deactivation hooks
    /// of its active nodes, then removes the subtree. The root cannot be torn down.
    pub fn teardown(&self, id: NodeId) {
        self.tear_down(id, false)
    }

    /// `released` is set when `id` itself just lost its last hold.
    fn tear_down(&self, id: NodeId, released: bool) {
        let (lifecycles, hooks, release_parent) = {
            let tree = self.tree();
            let Some(node) = tree.get(id) else {
                return;
            };
            let Some(parent) = node.parent else {
                return;
            };
            let release_parent = (node.observers > 0).then_some(parent);
            let nodes = tree.subtree(id);
            let mut lifecycles = Vec::new();
            let mut hooks = Vec::new();
            for &id in &nodes {
                if let Some(node) = tree.get(id) {
                    lifecycles.push(node.lifecycle);
                }
            }
            for &node_id in nodes.iter().rev() {
                if let Some(node) = tree.get(node_id)
                    && (node.is_active() || (released && node_id == id))
                {
                    tree.collect_hooks(node_id, HookKind::Deactivate, &mut hooks);
                }
            }
            (lifecycles, hooks, release_parent)
        };
        self.cancel_owners(&lifecycles);
        for hook in hooks {
            hook();
        }
        let mut removed = self.tree().remove_subtree(id);
        let lifecycles: Vec<LifecycleId> = removed.iter().map(|n| n.lifecycle).collect();
        self.cancel_owners(&lifecycles);
        for node in &mut removed {
            tracing::debug!(path = %node.path, "scope torn down");
            node.events.close();
        }
        drop(removed);
        if let Some(parent) = release_parent {
            self.release(parent, Hold::Observer);
        }
    }

    fn cancel_owners(&self, lifecycles: &[LifecycleId]) {
        let cancellables: Vec<Cancellable> = {
            let mut registry = self.registry();
            lifecycles
                .iter()
                .flat_map(|&owner| registry.cancel_owner(owner))
                .collect()
        };
        run_all(cancellables);
    }

    /// Adds a hook for the path of `id` that is kept until removed, across teardowns of the
    /// node. An activation hook added to an active node runs immediately.
    pub fn add_scope_hook(&self, id: NodeId, kind: HookKind, hook: Hook) -> Option<ScopeHookKey> {
        let (key, fire) = {
            let mut tree = self.tree();
            let node = tree.get(id)?;
            let site = node.site();
            let fire = kind == HookKind::Activate && node.is_active();
            let key = tree
                .scope_hooks
                .entry(site.clone())
                .or_insert_with(SlabMap::new)
                .insert((kind, hook.clone()));
            (ScopeHookKey { site, key }, fire)
        };
        if fire {
            hook();
        }
        Some(key)
    }
    pub fn remove_scope_hook(&self, key: &ScopeHookKey) {
        let hook = {
            let mut tree = self.tree();
            let Some(table) = tree.scope_hooks.get_mut(&key.site) else {
                return;
            };
            let hook = table.remove(key.key);
            if table.is_empty() {
                tree.scope_hooks.remove(&key.site);
            }
            hook
        };
        drop(hook);
    }

    /// Adds a hook owned by the node. An activation hook added to an active node runs
    /// immediately.
    pub fn add_hook(&self, id: NodeId, kind: HookKind, hook: Hook) -> Option<usize> {
        let (key, fire) = {
            let mut tree = self.tree();
            let node = tree.get_mut(id)?;
            let key = node.hooks_mut(kind).insert(hook.clone());
            (key, kind == HookKind::Activate && node.is_active())
        };
        if fire {
            hook();
        }
        Some(key)
    }

    /// Places the structural hold of a container on `id`, adding `hook` to its activation
    /// hooks. Does nothing if the node is already held.
    pub fn hold_structural(&self, id: NodeId, hook: Hook) -> bool {
        let hooks = {
            let mut tree = self.tree();
            let Some(node) = tree.get_mut(id) else {
                return false;
            };
            if node.structural_hold {
                return true;
            }
            let was_active = node.is_active();
            node.on_activate.insert(hook.clone());
            node.structural_hold = true;
            if was_active {
                vec![hook]
            } else {
                tracing::debug!(path = %node.path, "scope activated");
                let mut hooks = Vec::new();
                tree.collect_hooks(id, HookKind::Activate, &mut hooks);
                hooks
            }
        };
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn subscribe_events(&self, id: NodeId) -> Option<EventReceiver> {
        Some(self.tree().get_mut(id)?.events.subscribe())
    }

    pub fn send_event(&self, origin: NodeId, event: impl FnOnce(LensId) -> Event, receivers: Receivers) -> bool {
        let mut tree = self.tree();
        let Some(node) = tree.get(origin) else {
            return false;
        };
        let event = event(node.path.clone());
        let mut targets = Vec::new();
        if receivers.contains(Receivers::SELF) {
            targets.push(origin);
        }
        let ancestors = tree.ancestors(origin);
        if receivers.contains(Receivers::ANCESTORS) {
            targets.extend(&ancestors);
        } else if receivers.contains(Receivers::PARENT) {
            targets.extend(ancestors.first());
        }
        if receivers.contains(Receivers::DESCENDANTS) {
            targets.extend(tree.subtree(origin).into_iter().skip(1));
        } else if receivers.contains(Receivers::CHILDREN) {
            targets.extend(tree.children(origin));
        }
        let mut seen = HashSet::new();
        for id in targets {
            if seen.insert(id)
                && let Some(node) = tree.get_mut(id)
            {
                node.events.send(&event);
            }
        }
        true
    }

    /// Returns the live model cached for `(access, type_id)`, evicting entries whose access
    /// token is gone.
    pub fn model(
        &self,
        id: NodeId,
        access: AccessId,
        type_id: TypeId,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let (model, evicted) = {
            let mut tree = self.tree();
            let node = tree.get_mut(id)?;
            let evicted = evict(node);
            let model = node.models.get(&(access, type_id)).map(|e| e.model.clone());
            (model, evicted)
        };
        drop(evicted);
        model
    }

    /// Caches `model` unless another one was cached first; returns the cached model and whether
    /// this is the first model of its type on the node.
    pub fn insert_model(
        &self,
        id: NodeId,
        access: &Arc<AccessId>,
        type_id: TypeId,
        model: Arc<dyn Any + Send + Sync>,
    ) -> Option<(Arc<dyn Any + Send + Sync>, bool)> {
        let mut tree = self.tree();
        let node = tree.get_mut(id)?;
        let first_of_type = node.model_types.insert(type_id);
        let entry = node
            .models
            .entry((**access, type_id))
            .or_insert_with(|| ModelEntry {
                owner: Arc::downgrade(access),
                model,
            });
        Some((entry.model.clone(), first_of_type))
    }

    /// Any live model of type `type_id` on the node.
    pub fn any_model(&self, id: NodeId, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        let tree = self.tree();
        let node = tree.get(id)?;
        node.models
            .iter()
            .filter(|((_, t), e)| *t == type_id && e.owner.strong_count() > 0)
            .map(|(_, e)| e.model.clone())
            .next()
    }

    pub fn evict_stale_models(&self, id: NodeId) -> usize {
        let evicted = match self.tree().get_mut(id) {
            Some(node) => evict(node),
            None => Vec::new(),
        };
        evicted.len()
    }

    pub fn model_count(&self, id: NodeId) -> usize {
        self.tree().get(id).map_or(0, |n| n.models.len())
    }

    pub fn begin_build(self: &Arc<Self>) -> BuildGuard {
        let thread = thread::current().id();
        *self.building.lock().unwrap().entry(thread).or_default() += 1;
        BuildGuard {
            core: self.clone(),
            thread,
        }
    }
    pub fn is_building(&self) -> bool {
        self.building
            .lock()
            .unwrap()
            .contains_key(&thread::current().id())
    }

    /// Registers `cancellable` under the lifecycle of `owner` and `keys`.
    ///
    /// With `in_flight`, every entry pending under that key is cancelled first.
    pub fn register(
        &self,
        owner: NodeId,
        keys: Vec<CancelKey>,
        in_flight: Option<CancelKey>,
        cancellable: Cancellable,
    ) -> Option<CancelId> {
        let (id, replaced) = {
            let tree = self.tree();
            let Some(lifecycle) = tree.get(owner).map(|n| n.lifecycle) else {
                drop(tree);
                cancellable.cancel();
                return None;
            };
            let mut registry = self.registry();
            match in_flight {
                Some(key) => registry.register_in_flight(lifecycle, key, keys, cancellable),
                None => (registry.register(lifecycle, keys, cancellable), Vec::new()),
            }
        };
        run_all(replaced);
        Some(id)
    }
    pub fn cancel_key(&self, key: &CancelKey) -> usize {
        let cancellables = self.registry().cancel_key(key);
        let count = cancellables.len();
        run_all(cancellables);
        count
    }
    pub fn cancel(&self, id: CancelId) -> bool {
        let cancellable = self.registry().cancel(id);
        let found = cancellable.is_some();
        if let Some(cancellable) = cancellable {
            cancellable.cancel();
        }
        found
    }
    pub fn cancel_node(&self, id: NodeId) -> usize {
        let Some(lifecycle) = self.lifecycle(id) else {
            return 0;
        };
        let cancellables = self.registry().cancel_owner(lifecycle);
        let count = cancellables.len();
        run_all(cancellables);
        count
    }
    pub fn complete(&self, id: CancelId) -> bool {
        self.registry().complete(id)
    }
    pub fn is_pending(&self, id: CancelId) -> bool {
        self.registry().contains(id)
    }
    pub fn pending(&self) -> usize {
        self.registry().len()
    }
    pub fn pending_for(&self, id: NodeId) -> usize {
        match self.lifecycle(id) {
            Some(lifecycle) => self.registry().pending_for(lifecycle),
            None => 0,
        }
    }
    pub fn pending_for_key(&self, key: &CancelKey) -> usize {
        self.registry().pending_for_key(key)
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        match &self.spawner {
            Some(spawner) => spawner
                .spawn(future)
                .map_err(|e| Error::Spawn(e.to_string())),
            None => match &*DEFAULT_POOL {
                Ok(pool) => {
                    pool.spawn_ok(future);
                    Ok(())
                }
                Err(e) => Err(Error::Spawn(e.clone())),
            },
        }
    }

    pub fn report(&self, failure: &TaskFailure) {
        (self.failure_handler)(failure)
    }

    /// Tears down inactive nodes that no longer serve any purpose: nodes without a live handle
    /// that hold no models, cancellables or event receivers, and, with `check_state`, nodes whose
    /// value no longer exists. Returns the number of nodes removed.
    pub fn prune(&self, check_state: bool) -> usize {
        struct Candidate {
            id: NodeId,
            presence: Option<Arc<dyn Presence>>,
            bare: bool,
            children: Vec<NodeId>,
        }
        let (candidates, evicted) = {
            let mut tree = self.tree();
            let registry = self.registry();
            let root = tree.root();
            let mut candidates = Vec::new();
            let mut evicted = Vec::new();
            for id in tree.preorder() {
                if Some(id) == root {
                    continue;
                }
                let children = tree.children(id);
                let Some(node) = tree.get_mut(id) else {
                    continue;
                };
                if node.is_active() {
                    continue;
                }
                evicted.extend(evict(node));
                let bare = node.models.is_empty()
                    && !node.events.has_receivers()
                    && registry.pending_for(node.lifecycle) == 0;
                candidates.push(Candidate {
                    id,
                    presence: node.presence.as_ref().and_then(|p| p.upgrade()),
                    bare,
                    children,
                });
            }
            (candidates, evicted)
        };
        drop(evicted);

        let mut pruned = HashSet::new();
        for candidate in candidates.iter().rev() {
            let prune = match &candidate.presence {
                Some(presence) => check_state && !presence.exists(),
                None => {
                    candidate.bare && candidate.children.iter().all(|c| pruned.contains(c))
                }
            };
            if prune {
                pruned.insert(candidate.id);
            }
        }
        let before = self.node_count();
        for candidate in &candidates {
            if pruned.contains(&candidate.id) {
                self.teardown(candidate.id);
            }
        }
        drop(candidates);
        before.saturating_sub(self.node_count())
    }

    /// Cancels all registered work and removes every node, root included.
    pub fn shutdown(&self) {
        let cancellables = self.registry().drain();
        run_all(cancellables);
        let (mut nodes, hooks) = {
            let mut tree = self.tree();
            tree.root = None;
            (
                std::mem::take(&mut tree.nodes),
                std::mem::take(&mut tree.scope_hooks),
            )
        };
        drop(hooks);
        for (_, node) in &mut nodes {
            node.events.close();
        }
        drop(nodes);
        let cancellables = self.registry().drain();
        run_all(cancellables);
    }
}

pub(crate) fn default_failure_handler() -> FailureHandler {
    Arc::new(|failure: &TaskFailure| {
        tracing::error!(path = %failure.path, error = %failure.error, "task failed");
    })
}

fn evict(node: &mut Node) -> Vec<ModelEntry> {
    let stale: Vec<(AccessId, TypeId)> = node
        .models
        .iter()
        .filter(|(_, e)| e.owner.strong_count() == 0)
        .map(|(key, _)| *key)
        .collect();
    stale
        .into_iter()
        .filter_map(|key| node.models.remove(&key))
        .collect()
}

pub(crate) struct BuildGuard {
    core: Arc<TreeCore>,
    thread: ThreadId,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let mut building = self.core.building.lock().unwrap();
        if let Some(depth) = building.get_mut(&self.thread) {
            *depth -= 1;
            if *depth == 0 {
                building.remove(&self.thread);
            }
        }
    }
}
