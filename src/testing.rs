//! Assertions for tests that drive a store.
//!
//! A [`TestProbe`] collects [`AssertionFailure`]s instead of panicking, so a single test run
//! reports every mismatch it finds.

use std::{any::Any, fmt::Debug};

use parse_display::Display;

use crate::{
    core::{State, Store},
    event::{Event, EventReceiver},
    scope::Scope,
};

#[cfg(test)]
mod tests;

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum AssertionFailure {
    #[display("state mismatch\nexpected:\n{expected}\nactual:\n{actual}")]
    StateMismatch { expected: String, actual: String },

    #[display("expected event {expected} was not received")]
    EventNotReceived { expected: String },

    #[display("unexpected event {event}")]
    UnexpectedEvent { event: String },

    #[display("{count} task(s) still pending at the end of the test")]
    OutstandingTasks { count: usize },

    #[display("{count} event(s) left unconsumed at the end of the test")]
    UnconsumedEvents { count: usize },
}

impl std::error::Error for AssertionFailure {}

/// Wraps a store under test.
///
/// Every event that reaches the root scope is queued on the probe; [`expect_event`]
/// consumes them in order.
///
/// [`expect_event`]: Self::expect_event
pub struct TestProbe<S: State> {
    store: Store<S>,
    events: Option<EventReceiver>,
    failures: Vec<AssertionFailure>,
}

impl<S: State> TestProbe<S> {
    pub fn new(store: Store<S>) -> Self {
        let events = store.scope().events().ok();
        Self {
            store,
            events,
            failures: Vec::new(),
        }
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }
    pub fn scope(&self) -> Scope<S> {
        self.store.scope()
    }

    /// Failures recorded so far.
    pub fn failures(&self) -> &[AssertionFailure] {
        &self.failures
    }

    /// Publishes pending writes, then compares the state reads see with `expected`.
    pub fn expect_state(&mut self, expected: &S) -> bool
    where
        S: PartialEq + Debug,
    {
        self.store.flush();
        let actual = self.store.state();
        if *actual == *expected {
            return true;
        }
        self.failures.push(AssertionFailure::StateMismatch {
            expected: format!("{expected:#?}"),
            actual: format!("{actual:#?}"),
        });
        false
    }

    /// Consumes the next event and checks that it carries `expected`.
    pub fn expect_event<E>(&mut self, expected: &E) -> bool
    where
        E: Any + Send + Sync + PartialEq + Debug,
    {
        let next = self.events.as_mut().and_then(|events| events.try_recv());
        let Some(event) = next else {
            self.failures.push(AssertionFailure::EventNotReceived {
                expected: format!("{expected:?}"),
            });
            return false;
        };
        match event.downcast_ref::<E>() {
            Some(payload) if payload == expected => true,
            Some(payload) => {
                self.failures.push(AssertionFailure::UnexpectedEvent {
                    event: format!("{payload:?} from `{}`", event.origin_path()),
                });
                false
            }
            None => {
                self.failures.push(AssertionFailure::UnexpectedEvent {
                    event: describe(&event),
                });
                false
            }
        }
    }

    /// Discards queued events; returns how many were dropped.
    pub fn skip_events(&mut self) -> usize {
        self.events
            .as_mut()
            .map_or(0, |events| events.drain().len())
    }

    /// Checks that no task is pending and no event is left; returns every recorded failure.
    pub fn finish(mut self) -> Vec<AssertionFailure> {
        self.store.flush();
        let count = self.store.pending_tasks();
        if count > 0 {
            self.failures
                .push(AssertionFailure::OutstandingTasks { count });
        }
        let count = self.skip_events();
        if count > 0 {
            self.failures
                .push(AssertionFailure::UnconsumedEvents { count });
        }
        std::mem::take(&mut self.failures)
    }
}

fn describe(event: &Event) -> String {
    format!("of another type from `{}`", event.origin_path())
}
