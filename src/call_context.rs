use std::{
    fmt::{self, Debug},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

type Wrapper = dyn Fn(&mut dyn FnMut()) + Send + Sync;

/// A wrapper captured when state is mutated and replayed around the deferred notification.
///
/// A UI layer uses this to run invalidation inside, for example, an animation transaction that
/// was open when the write happened.
#[derive(Clone)]
pub struct CallContext {
    id: u64,
    wrap: Arc<Wrapper>,
}

impl CallContext {
    /// `wrap` must call the given function exactly once.
    pub fn new(wrap: impl Fn(&mut dyn FnMut()) + Send + Sync + 'static) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            wrap: Arc::new(wrap),
        }
    }
}

impl PartialEq for CallContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for CallContext {}

impl Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallContext({})", self.id)
    }
}

/// Ordered stack of [`CallContext`]s active for a write, outermost first.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct BatchContext(Arc<[CallContext]>);

impl BatchContext {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn contexts(&self) -> &[CallContext] {
        &self.0
    }
    pub fn push(&self, context: CallContext) -> Self {
        Self(self.0.iter().cloned().chain([context]).collect())
    }

    /// Runs `f` inside every wrapper of the stack.
    pub fn run(&self, f: impl FnOnce()) {
        let mut f = Some(f);
        run_nested(&self.0, &mut || {
            if let Some(f) = f.take() {
                f()
            }
        });
    }
}

fn run_nested(contexts: &[CallContext], f: &mut dyn FnMut()) {
    match contexts.split_first() {
        Some((outer, rest)) => (outer.wrap)(&mut || run_nested(rest, f)),
        None => f(),
    }
}
