//! A hierarchical, lens-addressed state tree with fine-grained observation.
//!
//! A [`Store`] owns one immutable snapshot of the application state. [`Scope`]s address parts
//! of it through [`Lens`]es, form a tree that activates and tears down with its observers, and
//! own the cancellable work started on their behalf.

mod call_context;
mod cancel;
mod core;
mod error;
mod event;
mod lens;
mod observe;
mod scope;
mod structure;
mod subscription;
mod task;

pub mod replay;
pub mod testing;
pub mod utils;

pub use call_context::*;
pub use cancel::{CancelId, CancelKey, Cancellable, CancellationRegistry, LifecycleId};
pub use crate::core::{
    AccessId, FlushPolicy, NodeId, State, StateChange, Store, StoreBuilder, StoreConfig,
};
pub use error::*;
pub use event::{Event, EventReceiver, Receivers};
pub use lens::*;
pub use observe::Observer;
pub use scope::{AccessToken, BuildContext, Model, Scope};
pub use structure::{Structural, StructuralDiff};
pub use subscription::*;
pub use task::*;
