//! Asynchronous work bound to the lifetime of a scope.

use std::{
    error::Error as StdError,
    fmt,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::{AbortHandle, Abortable};
use parse_display::Display;

use crate::{
    cancel::{CancelId, CancelKey, Cancellable},
    core::{State, TreeCore},
    error::Result,
    lens::LensId,
    scope::Scope,
};


/// Error a task returns when it stopped because it observed its own cancellation.
///
/// Tasks ending with this error are not reported as failures.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display("cancelled")]
pub struct Cancelled;

impl StdError for Cancelled {}

/// A task that ended with an error.
pub struct TaskFailure {
    /// Path of the scope that started the task.
    pub path: LensId,
    pub error: Box<dyn StdError + Send + Sync>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task of `{}` failed: {}", self.path, self.error)
    }
}
impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("path", &self.path)
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Cancels every task pending under this key before the new one starts, and registers the
    /// new one under it.
    pub cancel_in_flight: Option<CancelKey>,
    /// Additional keys the task is registered under.
    pub keys: Vec<CancelKey>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel_in_flight(mut self, key: CancelKey) -> Self {
        self.cancel_in_flight = Some(key);
        self
    }
    pub fn key(mut self, key: CancelKey) -> Self {
        self.keys.push(key);
        self
    }
}

/// Passed to a task body.
pub struct TaskContext<T> {
    scope: Scope<T>,
}

impl<T: State> TaskContext<T> {
    /// The scope that started the task, carrying its cancellation keys and call contexts.
    ///
    /// Tasks started through it inherit those keys.
    pub fn scope(&self) -> &Scope<T> {
        &self.scope
    }
}

/// Handle of a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    id: CancelId,
    core: Weak<TreeCore>,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> CancelId {
        self.id
    }

    /// Cancels the task; returns `false` if it already finished or was cancelled.
    pub fn cancel(&self) -> bool {
        self.core.upgrade().is_some_and(|core| core.cancel(self.id))
    }

    /// Whether the task ran to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || self.core.upgrade().is_none_or(|core| !core.is_pending(self.id))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: State> Scope<T> {
    /// Spawns `body` for the lifetime of this scope.
    ///
    /// The task is cancelled when the scope deactivates or is torn down, or when one of the
    /// handle's cancellation keys is cancelled. Cancellation stops the task at its next
    /// suspension point. A task ending with an error other than [`Cancelled`] is reported to
    /// the store's failure handler.
    pub fn task<F, Fut, E>(&self, body: F) -> Result<TaskHandle>
    where
        F: FnOnce(TaskContext<T>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        self.task_with(TaskOptions::default(), body)
    }

    pub fn task_with<F, Fut, E>(&self, options: TaskOptions, body: F) -> Result<TaskHandle>
    where
        F: FnOnce(TaskContext<T>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let cancellable = {
            let abort = abort.clone();
            Cancellable::new(move || abort.abort())
        };
        let id = self.register(options.keys, options.cancel_in_flight, cancellable)?;
        let future = Abortable::new(
            body(TaskContext {
                scope: self.clone(),
            }),
            registration,
        );
        let core = Arc::downgrade(self.core());
        let path = self.path().clone();
        let finished = Arc::new(AtomicBool::new(false));
        let task = {
            let finished = finished.clone();
            async move {
                let result = future.await;
                finished.store(true, Ordering::Release);
                let Some(core) = core.upgrade() else {
                    return;
                };
                core.complete(id);
                match result {
                    Err(_aborted) => tracing::trace!(path = %path, "task cancelled"),
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        let error: Box<dyn StdError + Send + Sync> = error.into();
                        if error.is::<Cancelled>() {
                            tracing::trace!(path = %path, "task cancelled itself");
                        } else {
                            core.report(&TaskFailure { path, error });
                        }
                    }
                }
            }
        };
        if let Err(e) = self.core().spawn(task) {
            self.core().complete(id);
            abort.abort();
            return Err(e);
        }
        Ok(TaskHandle {
            id,
            core: Arc::downgrade(self.core()),
            finished,
        })
    }
}
