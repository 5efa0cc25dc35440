use parse_display::Display;

use crate::lens::LensId;

/// Errors returned by recoverable store operations.
///
/// Contract violations (mutating state while a model is being built, skipping an intermediate
/// scope, ...) are not represented here; they panic.
#[non_exhaustive]
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Error {
    /// The scope was torn down and its state no longer exists.
    #[display("scope `{0}` is detached from its store")]
    Detached(LensId),

    /// A write was attempted through a lens without a setter.
    #[display("lens `{0}` is read-only")]
    ReadOnlyLens(LensId),

    /// The lens does not match the current state (removed element, `None` optional, ...).
    #[display("no value at `{0}`")]
    Missing(LensId),

    /// The store was dropped while a handle was still in use.
    #[display("store was dropped")]
    StoreDropped,

    /// The spawner refused a task.
    #[display("failed to spawn task: {0}")]
    Spawn(String),
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;
