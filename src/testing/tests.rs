use pretty_assertions::assert_eq;

use super::*;
use crate::{Cancellable, FlushPolicy, Receivers, lens};

#[derive(Clone, Debug, Default, PartialEq)]
struct App {
    count: u32,
}

#[derive(Debug, PartialEq)]
struct Ping(u32);

fn probe() -> TestProbe<App> {
    TestProbe::new(
        Store::builder(App::default())
            .flush_policy(FlushPolicy::Manual)
            .build(),
    )
}

fn send(probe: &TestProbe<App>, payload: impl std::any::Any + Send + Sync) {
    probe
        .scope()
        .scope(lens!(App, count))
        .send_event(payload, Receivers::default())
        .unwrap();
}

#[test]
fn matching_state() {
    let mut probe = probe();
    probe
        .scope()
        .write_at(&lens!(App, count), |c| *c = 1)
        .unwrap();
    assert!(probe.expect_state(&App { count: 1 }));
    assert!(!probe.store().has_pending_writes());
    assert!(probe.finish().is_empty());
}

#[test]
fn state_mismatch() {
    let mut probe = probe();
    probe.scope().set(App { count: 1 }).unwrap();
    assert!(!probe.expect_state(&App { count: 2 }));
    assert_eq!(
        probe.failures(),
        [AssertionFailure::StateMismatch {
            expected: "App {\n    count: 2,\n}".into(),
            actual: "App {\n    count: 1,\n}".into(),
        }]
    );
}

#[test]
fn events_are_consumed_in_order() {
    let mut probe = probe();
    send(&probe, Ping(1));
    send(&probe, Ping(2));
    assert!(probe.expect_event(&Ping(1)));
    assert!(probe.expect_event(&Ping(2)));
    assert!(probe.finish().is_empty());
}

#[test]
fn wrong_events() {
    let mut probe = probe();
    send(&probe, Ping(2));
    send(&probe, "text");
    assert!(!probe.expect_event(&Ping(1)));
    assert!(!probe.expect_event(&Ping(1)));
    assert!(!probe.expect_event(&Ping(3)));
    assert_eq!(
        probe.finish(),
        vec![
            AssertionFailure::UnexpectedEvent {
                event: "Ping(2) from `count`".into()
            },
            AssertionFailure::UnexpectedEvent {
                event: "of another type from `count`".into()
            },
            AssertionFailure::EventNotReceived {
                expected: "Ping(3)".into()
            },
        ]
    );
}

#[test]
fn skipped_events() {
    let mut probe = probe();
    send(&probe, Ping(1));
    send(&probe, Ping(2));
    assert_eq!(probe.skip_events(), 2);
    assert_eq!(probe.skip_events(), 0);
    assert!(!probe.expect_event(&Ping(1)));
}

#[test]
fn finish_reports_leftovers() {
    let probe = probe();
    probe
        .scope()
        .register_cancellable(Cancellable::new(|| {}))
        .unwrap();
    send(&probe, Ping(1));
    send(&probe, Ping(2));
    assert_eq!(
        probe.finish(),
        vec![
            AssertionFailure::OutstandingTasks { count: 1 },
            AssertionFailure::UnconsumedEvents { count: 2 },
        ]
    );
}

#[test]
fn failure_display() {
    assert_eq!(
        AssertionFailure::OutstandingTasks { count: 2 }.to_string(),
        "2 task(s) still pending at the end of the test"
    );
    assert_eq!(
        AssertionFailure::EventNotReceived {
            expected: "Ping(1)".into()
        }
        .to_string(),
        "expected event Ping(1) was not received"
    );
    assert_eq!(
        AssertionFailure::StateMismatch {
            expected: "1".into(),
            actual: "2".into()
        }
        .to_string(),
        "state mismatch\nexpected:\n1\nactual:\n2"
    );
}
