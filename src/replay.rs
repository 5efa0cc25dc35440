//! History of published states and the override pointer used to replay them.
//!
//! A debugging front end exchanges [`OverridePointer`] and [`ReplayCommand`] messages with a
//! [`Replay`]; both serialize to JSON objects.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::{
    Stream,
    channel::mpsc::{UnboundedSender, unbounded},
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

use crate::{
    Subscription,
    core::{RootShared, State, Store},
};


/// The snapshot currently shown instead of the live state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverridePointer {
    pub index: usize,
    pub count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ReplayCommand {
    SetOverride { index: usize },
    ClearOverride,
    PrintDiff { index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutput {
    Pointer(Option<OverridePointer>),
    Diff(String),
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ReplayError {
    #[display("snapshot {index} is out of range (history has {count})")]
    OutOfRange { index: usize, count: usize },
}

impl std::error::Error for ReplayError {}

/// Bounded record of published snapshots, oldest first.
pub struct History<S> {
    snapshots: VecDeque<Arc<S>>,
    limit: usize,
}

impl<S> History<S> {
    pub fn new(limit: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Appends `snapshot`; returns `true` if the oldest snapshot was dropped to make room.
    pub fn push(&mut self, snapshot: Arc<S>) -> bool {
        self.snapshots.push_back(snapshot);
        if self.snapshots.len() > self.limit {
            self.snapshots.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
    pub fn limit(&self) -> usize {
        self.limit
    }
    pub fn get(&self, index: usize) -> Option<&Arc<S>> {
        self.snapshots.get(index)
    }
    pub fn latest(&self) -> Option<&Arc<S>> {
        self.snapshots.back()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<S>> {
        self.snapshots.iter()
    }
}

struct ReplayState<S> {
    history: History<S>,
    pointer: Option<OverridePointer>,
    listeners: Vec<UnboundedSender<Option<OverridePointer>>>,
}

impl<S> ReplayState<S> {
    fn publish_pointer(&mut self) {
        let pointer = self.pointer;
        self.listeners
            .retain(|tx| tx.unbounded_send(pointer).is_ok());
    }

    fn record(&mut self, snapshot: Arc<S>) {
        let dropped = self.history.push(snapshot);
        if let Some(pointer) = &mut self.pointer {
            if dropped {
                pointer.index = pointer.index.saturating_sub(1);
            }
            pointer.count = self.history.len();
            self.publish_pointer();
        }
    }
}

/// Records the live states a store publishes and replays them as overrides.
pub struct Replay<S: State> {
    root: Arc<RootShared<S>>,
    state: Arc<Mutex<ReplayState<S>>>,
    _tap: Subscription,
}

impl<S: State> Replay<S> {
    /// Starts recording with the store's configured history limit.
    pub fn attach(store: &Store<S>) -> Self {
        Self::with_limit(store, store.config().history_limit)
    }

    pub fn with_limit(store: &Store<S>, limit: usize) -> Self {
        let mut history = History::new(limit);
        history.push(store.published_state());
        let state = Arc::new(Mutex::new(ReplayState {
            history,
            pointer: None,
            listeners: Vec::new(),
        }));
        let tap = {
            let state = state.clone();
            store.subscribe(move |change| {
                if !change.is_override_update {
                    state.lock().unwrap().record(change.current.clone());
                }
            })
        };
        Self {
            root: store.shared().clone(),
            state,
            _tap: tap,
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplayState<S>> {
        self.state.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.state().history.len()
    }
    pub fn is_empty(&self) -> bool {
        self.state().history.is_empty()
    }
    pub fn snapshot(&self, index: usize) -> Option<Arc<S>> {
        self.state().history.get(index).cloned()
    }
    pub fn snapshots(&self) -> Vec<Arc<S>> {
        self.state().history.iter().cloned().collect()
    }

    pub fn pointer(&self) -> Option<OverridePointer> {
        self.state().pointer
    }

    /// Stream of the active pointer, starting with the current one.
    pub fn pointers(&self) -> impl Stream<Item = Option<OverridePointer>> + Send + Unpin + use<S> {
        let (tx, rx) = unbounded();
        let mut state = self.state();
        let _ = tx.unbounded_send(state.pointer);
        state.listeners.push(tx);
        rx
    }

    /// Shows snapshot `index` instead of the live state.
    pub fn set_override(&self, index: usize) -> Result<OverridePointer, ReplayError> {
        let (snapshot, pointer) = {
            let state = self.state();
            let count = state.history.len();
            let snapshot = state
                .history
                .get(index)
                .cloned()
                .ok_or(ReplayError::OutOfRange { index, count })?;
            (snapshot, OverridePointer { index, count })
        };
        self.root.set_override(Some(snapshot));
        let mut state = self.state();
        state.pointer = Some(pointer);
        state.publish_pointer();
        Ok(pointer)
    }

    /// Returns to the live state.
    pub fn clear_override(&self) {
        self.root.set_override(None);
        let mut state = self.state();
        if state.pointer.take().is_some() {
            state.publish_pointer();
        }
    }

    pub fn apply(&self, command: ReplayCommand) -> Result<ReplayOutput, ReplayError>
    where
        S: Debug,
    {
        match command {
            ReplayCommand::SetOverride { index } => {
                Ok(ReplayOutput::Pointer(Some(self.set_override(index)?)))
            }
            ReplayCommand::ClearOverride => {
                self.clear_override();
                Ok(ReplayOutput::Pointer(None))
            }
            ReplayCommand::PrintDiff { index } => Ok(ReplayOutput::Diff(self.print_diff(index)?)),
        }
    }

    /// Line diff of the `Debug` rendering of snapshot `index` against the one before it.
    ///
    /// Removed lines start with `- `, added lines with `+ `, unchanged lines with two spaces.
    pub fn print_diff(&self, index: usize) -> Result<String, ReplayError>
    where
        S: Debug,
    {
        let (before, after) = {
            let state = self.state();
            let count = state.history.len();
            let after = state
                .history
                .get(index)
                .ok_or(ReplayError::OutOfRange { index, count })?;
            let before = index.checked_sub(1).and_then(|i| state.history.get(i));
            (
                before.map(|s| format!("{:#?}", s)).unwrap_or_default(),
                format!("{:#?}", after),
            )
        };
        Ok(line_diff(&before, &after))
    }
}

fn line_diff(before: &str, after: &str) -> String {
    let mut out = String::new();
    for change in TextDiff::from_lines(before, after).iter_all_changes() {
        out.push_str(match change.tag() {
            ChangeTag::Equal => "  ",
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
        });
        out.push_str(change.value());
        if change.missing_newline() {
            out.push('\n');
        }
    }
    out
}
