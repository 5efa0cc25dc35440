use std::sync::{Arc, Mutex};

use assert_call::{CallRecorder, call};
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::*;
use crate::{CallContext, Cancellable, Error, lens};

#[derive(Clone, Debug, Default, PartialEq)]
struct Pair {
    a: u32,
    b: u32,
}

fn manual(state: Pair) -> Store<Pair> {
    Store::builder(state)
        .flush_policy(FlushPolicy::Manual)
        .build()
}

fn record(store: &Store<Pair>) -> (Arc<Mutex<Vec<StateChange<Pair>>>>, Subscription) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let subscription = store.subscribe({
        let changes = changes.clone();
        move |change| changes.lock().unwrap().push(change.clone())
    });
    (changes, subscription)
}

fn values(changes: &Mutex<Vec<StateChange<Pair>>>) -> Vec<(Pair, Pair)> {
    changes
        .lock()
        .unwrap()
        .iter()
        .map(|c| ((*c.previous).clone(), (*c.current).clone()))
        .collect()
}

fn pair(a: u32, b: u32) -> Pair {
    Pair { a, b }
}

#[test]
fn writes_of_one_writer_are_coalesced() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    a.set(1).unwrap();
    a.set(2).unwrap();
    assert!(store.has_pending_writes());
    assert!(values(&changes).is_empty());
    assert_eq!(*store.state(), pair(2, 0));
    assert_eq!(*store.published_state(), pair(0, 0));

    store.flush();
    assert!(!store.has_pending_writes());
    assert_eq!(values(&changes), vec![(pair(0, 0), pair(2, 0))]);
}

#[test]
fn writer_switch_publishes_previous_batch() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    let b = store.scope().scope(lens!(Pair, b));
    a.set(1).unwrap();
    b.set(1).unwrap();
    assert_eq!(values(&changes), vec![(pair(0, 0), pair(1, 0))]);

    store.flush();
    assert_eq!(
        values(&changes),
        vec![(pair(0, 0), pair(1, 0)), (pair(1, 0), pair(1, 1))]
    );
}

#[test]
fn batch_switch_publishes_previous_batch() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    a.set(1).unwrap();
    a.with_call_context(CallContext::new(|f| f()), |a| a.set(2).unwrap());
    store.flush();
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes[0].batch.is_empty());
    assert_eq!(changes[1].batch.contexts().len(), 1);
}

#[test]
fn delivered_changes_form_a_chain() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    let b = store.scope().scope(lens!(Pair, b));
    for i in 1..=5 {
        a.set(i).unwrap();
        b.set(i).unwrap();
    }
    store.flush();
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 10);
    for w in changes.windows(2) {
        assert!(Arc::ptr_eq(&w[0].current, &w[1].previous));
    }
}

#[test]
fn immediate_policy_publishes_every_write() {
    let store = Store::builder(Pair::default())
        .flush_policy(FlushPolicy::Immediate)
        .build();
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    a.set(1).unwrap();
    a.set(2).unwrap();
    assert_eq!(
        values(&changes),
        vec![(pair(0, 0), pair(1, 0)), (pair(1, 0), pair(2, 0))]
    );
}

#[test]
fn flush_without_pending_writes_does_nothing() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    store.flush();
    store.flush();
    assert!(values(&changes).is_empty());
    assert!(Arc::ptr_eq(&store.state(), &store.published_state()));
}

#[test]
fn change_origin_is_the_writer() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));
    a.set(3).unwrap();
    store.flush();
    assert_eq!(changes.lock().unwrap()[0].origin, Some(a.node().unwrap()));
}

#[test]
fn flush_due_takes_the_earlier_bound() {
    let store = manual(Pair::default());
    let shared = store.shared();
    let poll = Duration::from_millis(10);
    let max = Duration::from_millis(100);
    assert_eq!(shared.flush_due(Instant::now(), poll, max), None);

    store.scope().scope(lens!(Pair, a)).set(1).unwrap();
    let now = Instant::now();
    let due = shared.flush_due(now, poll, max).unwrap();
    assert!(due <= poll);
    assert_eq!(
        shared.flush_due(now + Duration::from_secs(1), poll, max),
        Some(Duration::ZERO)
    );
}

#[test]
fn override_replaces_reads_and_drops_live_writes() {
    let store = manual(pair(1, 1));
    let (changes, _s) = record(&store);
    let a = store.scope().scope(lens!(Pair, a));

    store.set_override(Some(pair(9, 9)));
    assert!(store.is_overridden());
    assert_eq!(a.get(), 9);

    a.set(5).unwrap();
    assert!(!store.has_pending_writes());
    assert_eq!(*store.live_state(), pair(1, 1));
    assert_eq!(*store.state(), pair(9, 9));

    store.set_override(None);
    assert!(!store.is_overridden());
    assert_eq!(a.get(), 1);

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|c| c.is_override_update));
    assert!(changes[0].is_override_transition());
    assert!(changes[0].is_overridden && !changes[0].was_overridden);
    assert!(changes[1].was_overridden && !changes[1].is_overridden);
    assert_eq!(*changes[1].current, pair(1, 1));
}

#[test]
fn override_scope_writes_the_override_snapshot() {
    let store = manual(pair(1, 1));
    let (changes, _s) = record(&store);
    store.set_override(Some(pair(2, 2)));
    let a = store.override_scope().scope(lens!(Pair, a));
    a.set(3).unwrap();
    assert_eq!(*store.state(), pair(3, 2));
    assert_eq!(*store.live_state(), pair(1, 1));

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes[1].is_override_update);
    assert!(!changes[1].is_override_transition());
    assert_eq!(*changes[1].previous, pair(2, 2));
}

#[test]
fn override_scope_writes_live_state_without_override() {
    let store = manual(pair(1, 1));
    store.override_scope().scope(lens!(Pair, b)).set(4).unwrap();
    store.flush();
    assert_eq!(*store.published_state(), pair(1, 4));
}

#[test]
fn set_override_publishes_pending_writes_first() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    store.scope().scope(lens!(Pair, a)).set(1).unwrap();
    store.set_override(Some(pair(7, 7)));
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    assert!(!changes[0].is_override_update);
    assert_eq!(*changes[0].current, pair(1, 0));
    assert!(changes[1].is_override_update);
}

#[test]
fn same_override_snapshot_is_not_redelivered() {
    let store = manual(Pair::default());
    let (changes, _s) = record(&store);
    let snapshot = Arc::new(pair(5, 5));
    store.set_override_snapshot(Some(snapshot.clone()));
    store.set_override_snapshot(Some(snapshot));
    store.set_override(None);
    store.set_override(None);
    assert_eq!(changes.lock().unwrap().len(), 2);
}

#[test]
fn taps_run_in_subscription_order_until_dropped() {
    let mut cr = CallRecorder::new();
    let store = manual(Pair::default());
    let first = store.subscribe(|_| call!("first"));
    let _second = store.subscribe(|_| call!("second"));
    store.scope().set(pair(1, 1)).unwrap();
    store.flush();
    cr.verify(["first", "second"]);

    drop(first);
    store.scope().set(pair(2, 2)).unwrap();
    store.flush();
    cr.verify("second");
}

#[test]
fn dropping_the_store_cancels_and_detaches() {
    let mut cr = CallRecorder::new();
    let store = manual(Pair::default());
    let a = store.scope().scope(lens!(Pair, a));
    a.register_cancellable(Cancellable::new(|| call!("cancel")))
        .unwrap();
    assert_eq!(store.pending_tasks(), 1);
    drop(store);
    cr.verify("cancel");
    assert_eq!(a.node(), Err(Error::StoreDropped));
    assert!(a.retain().is_err());
}

#[test]
#[should_panic(expected = "mutated while a model was being built")]
fn writing_while_building_panics() {
    let store = manual(Pair::default());
    let scope = store.scope();
    let _guard = scope.core().begin_build();
    scope.set(pair(1, 1)).unwrap();
}

#[test]
fn config_defaults() {
    let config = StoreConfig::default();
    assert_eq!(config.flush, FlushPolicy::coalesce());
    assert_eq!(config.history_limit, 256);
    assert_eq!(
        FlushPolicy::default(),
        FlushPolicy::Coalesce {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(100),
        }
    );
}

#[rstest]
#[case("{}", StoreConfig::new())]
#[case(r#"{"flush":"manual"}"#, StoreConfig { flush: FlushPolicy::Manual, ..StoreConfig::new() })]
#[case(r#"{"flush":"immediate","history_limit":8}"#, StoreConfig { flush: FlushPolicy::Immediate, history_limit: 8 })]
#[case(
    r#"{"flush":{"coalesce":{"poll_interval":{"secs":0,"nanos":5000000},"max_wait":{"secs":1,"nanos":0}}}}"#,
    StoreConfig {
        flush: FlushPolicy::Coalesce {
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(1),
        },
        ..StoreConfig::new()
    }
)]
fn config_from_json(#[case] json: &str, #[case] expected: StoreConfig) {
    let config: StoreConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config, expected);
}

#[test]
fn node_ids_are_not_reused() {
    let store = manual(Pair::default());
    let root = store.scope();
    let a = root.scope(lens!(Pair, a));
    let first = a.node().unwrap();
    let retain = a.retain().unwrap();
    drop(retain);
    assert!(!store.shared().core().contains(first));

    let second = a.node().unwrap();
    assert_ne!(first, second);
    assert_eq!(store.shared().core().path(second), Some(a.path().clone()));
}
