use assert_call::{CallRecorder, call};
use pretty_assertions::assert_eq;

use super::*;

fn cancellable(name: &'static str) -> Cancellable {
    Cancellable::new(move || call!("cancel {name}"))
}

#[test]
fn cancel_owner_runs_each_entry_once() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let owner = LifecycleId::next();
    let other = LifecycleId::next();
    registry.register(owner, [], cancellable("a"));
    registry.register(owner, [], cancellable("b"));
    registry.register(other, [], cancellable("c"));
    assert_eq!(registry.pending_for(owner), 2);

    run_all(registry.cancel_owner(owner));
    cr.verify(["cancel a", "cancel b"]);
    assert_eq!(registry.pending_for(owner), 0);
    assert_eq!(registry.len(), 1);

    run_all(registry.cancel_owner(owner));
    cr.verify(());
}

#[test]
fn cancel_key_spans_owners() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let key = CancelKey::new("fetch");
    registry.register(LifecycleId::next(), [key.clone()], cancellable("a"));
    registry.register(LifecycleId::next(), [key.clone()], cancellable("b"));
    registry.register(LifecycleId::next(), [], cancellable("c"));

    let cancelled = registry.cancel_key(&key);
    assert_eq!(cancelled.len(), 2);
    run_all(cancelled);
    cr.verify(["cancel a", "cancel b"]);
    assert!(registry.cancel_key(&key).is_empty());
    assert_eq!(registry.len(), 1);
}

#[test]
fn entry_under_owner_and_key_is_cancelled_once() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let owner = LifecycleId::next();
    let key = CancelKey::new(1u8);
    registry.register(owner, [key.clone(), key.clone()], cancellable("a"));
    assert_eq!(registry.pending_for_key(&key), 1);

    run_all(registry.cancel_key(&key));
    run_all(registry.cancel_owner(owner));
    cr.verify("cancel a");
    assert!(registry.is_empty());
}

#[test]
fn register_in_flight_replaces_pending() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let owner = LifecycleId::next();
    let key = CancelKey::new("search");

    let (_, replaced) = registry.register_in_flight(owner, key.clone(), [], cancellable("1"));
    assert!(replaced.is_empty());
    let (_, replaced) = registry.register_in_flight(owner, key.clone(), [], cancellable("2"));
    run_all(replaced);
    cr.verify("cancel 1");
    assert_eq!(registry.pending_for_key(&key), 1);

    run_all(registry.cancel_key(&key));
    cr.verify("cancel 2");
}

#[test]
fn complete_removes_without_cancelling() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let owner = LifecycleId::next();
    let id = registry.register(owner, [CancelKey::new(0)], cancellable("a"));
    assert!(registry.contains(id));
    assert!(registry.complete(id));
    assert!(!registry.complete(id));
    assert!(registry.cancel(id).is_none());
    cr.verify(());
    assert_eq!(registry.pending_for(owner), 0);
}

#[test]
fn stale_id_does_not_reach_reused_slot() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    let owner = LifecycleId::next();
    let old = registry.register(owner, [], cancellable("old"));
    run_all(registry.cancel(old).into_iter().collect());
    cr.verify("cancel old");

    let new = registry.register(owner, [], cancellable("new"));
    assert_ne!(old, new);
    assert!(registry.cancel(old).is_none());
    assert!(registry.contains(new));
    cr.verify(());
}

#[test]
fn drain_returns_everything() {
    let mut cr = CallRecorder::new();
    let mut registry = CancellationRegistry::new();
    registry.register(LifecycleId::next(), [CancelKey::new(1)], cancellable("a"));
    registry.register(LifecycleId::next(), [], cancellable("b"));
    let mut drained = registry.drain();
    assert_eq!(drained.len(), 2);
    assert!(registry.is_empty());
    assert_eq!(registry.pending_for_key(&CancelKey::new(1)), 0);
    drained.clear();
    cr.verify(());
}
