//! Cancellation bookkeeping shared by every scope of a store.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

use parse_display::Display;
use slabmap::SlabMap;

use crate::utils::AnyKey;

#[cfg(test)]
mod tests;

/// Groups cancellables that can be cancelled together.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CancelKey(AnyKey);

impl CancelKey {
    pub fn new(key: impl Any + Send + Sync + Debug + Eq + Hash) -> Self {
        Self(AnyKey::new(key))
    }
}

/// Lifecycle of one scope node. Everything registered under it is cancelled when the node
/// deactivates or is torn down.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("lifecycle#{0}")]
pub struct LifecycleId(u64);

impl LifecycleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies one registration; stays unique after its slot is reused.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("cancel#{key}.{seq}")]
pub struct CancelId {
    key: usize,
    seq: u64,
}

/// A unit of work that can be told to stop.
#[must_use]
pub struct Cancellable {
    on_cancel: Box<dyn FnOnce() + Send>,
}

impl Cancellable {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Box::new(on_cancel),
        }
    }
    pub(crate) fn cancel(self) {
        (self.on_cancel)()
    }
}

impl Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cancellable")
    }
}

struct Entry {
    seq: u64,
    owner: LifecycleId,
    keys: Vec<CancelKey>,
    cancellable: Cancellable,
}

/// Table of pending cancellables indexed by owner and by key.
///
/// Operations that cancel return the affected [`Cancellable`]s instead of running them, so that
/// callers can release their lock first. Each returned cancellable has already been removed
/// from every index, so it can be cancelled at most once.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: SlabMap<Entry>,
    by_owner: HashMap<LifecycleId, HashSet<usize>>,
    by_key: HashMap<CancelKey, HashSet<usize>>,
    next_seq: u64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn pending_for(&self, owner: LifecycleId) -> usize {
        self.by_owner.get(&owner).map_or(0, |s| s.len())
    }
    pub fn pending_for_key(&self, key: &CancelKey) -> usize {
        self.by_key.get(key).map_or(0, |s| s.len())
    }
    pub fn contains(&self, id: CancelId) -> bool {
        self.entries.get(id.key).is_some_and(|e| e.seq == id.seq)
    }

    /// Registers `cancellable` under `owner` and every key in `keys`.
    pub fn register(
        &mut self,
        owner: LifecycleId,
        keys: impl IntoIterator<Item = CancelKey>,
        cancellable: Cancellable,
    ) -> CancelId {
        let mut keys: Vec<CancelKey> = keys.into_iter().collect();
        dedup(&mut keys);
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.entries.insert(Entry {
            seq,
            owner,
            keys: keys.clone(),
            cancellable,
        });
        self.by_owner.entry(owner).or_default().insert(key);
        for k in keys {
            self.by_key.entry(k).or_default().insert(key);
        }
        CancelId { key, seq }
    }

    /// Removes every entry pending under `in_flight`, then registers `cancellable` under
    /// `owner`, `in_flight` and `keys`.
    ///
    /// The returned list holds the replaced entries; run them before starting the new work.
    pub fn register_in_flight(
        &mut self,
        owner: LifecycleId,
        in_flight: CancelKey,
        keys: impl IntoIterator<Item = CancelKey>,
        cancellable: Cancellable,
    ) -> (CancelId, Vec<Cancellable>) {
        let replaced = self.cancel_key(&in_flight);
        let id = self.register(
            owner,
            std::iter::once(in_flight).chain(keys),
            cancellable,
        );
        (id, replaced)
    }

    /// Removes every entry registered under `key`.
    #[must_use]
    pub fn cancel_key(&mut self, key: &CancelKey) -> Vec<Cancellable> {
        let ids = self.by_key.remove(key).unwrap_or_default();
        self.take_all(ids)
    }

    /// Removes every entry owned by `owner`.
    #[must_use]
    pub fn cancel_owner(&mut self, owner: LifecycleId) -> Vec<Cancellable> {
        let ids = self.by_owner.remove(&owner).unwrap_or_default();
        self.take_all(ids)
    }

    /// Removes one entry.
    #[must_use]
    pub fn cancel(&mut self, id: CancelId) -> Option<Cancellable> {
        if !self.contains(id) {
            return None;
        }
        self.take(id.key)
    }

    /// Removes one entry without cancelling it; used when the work finished on its own.
    pub fn complete(&mut self, id: CancelId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.take(id.key).is_some()
    }

    /// Removes everything.
    #[must_use]
    pub fn drain(&mut self) -> Vec<Cancellable> {
        self.by_owner.clear();
        self.by_key.clear();
        let mut cancellables = Vec::new();
        for (_, entry) in std::mem::take(&mut self.entries) {
            cancellables.push(entry.cancellable);
        }
        cancellables
    }

    fn take_all(&mut self, ids: HashSet<usize>) -> Vec<Cancellable> {
        let mut ids: Vec<usize> = ids.into_iter().collect();
        ids.sort_by_key(|&key| self.entries.get(key).map_or(u64::MAX, |e| e.seq));
        ids.into_iter().filter_map(|key| self.take(key)).collect()
    }

    fn take(&mut self, key: usize) -> Option<Cancellable> {
        let entry = self.entries.remove(key)?;
        unlink(&mut self.by_owner, &entry.owner, key);
        for k in &entry.keys {
            unlink(&mut self.by_key, k, key);
        }
        Some(entry.cancellable)
    }
}

fn unlink<K: Hash + Eq>(index: &mut HashMap<K, HashSet<usize>>, k: &K, key: usize) {
    if let Some(set) = index.get_mut(k) {
        set.remove(&key);
        if set.is_empty() {
            index.remove(k);
        }
    }
}

fn dedup(keys: &mut Vec<CancelKey>) {
    let mut seen = HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
}

/// Runs cancellables returned by the registry.
pub(crate) fn run_all(cancellables: Vec<Cancellable>) {
    for c in cancellables {
        c.cancel();
    }
}
