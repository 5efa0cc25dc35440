use std::{
    any::Any,
    mem::take,
    sync::{Arc, Weak},
};

/// Handle that undoes a registration when dropped.
#[derive(Default)]
#[must_use]
pub struct Subscription(RawSubscription);

impl Subscription {
    pub fn empty() -> Self {
        Subscription(RawSubscription::Empty)
    }
    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Subscription(RawSubscription::Fn(Box::new(f)))
    }
    pub fn from_arc(arc: Arc<dyn Any + Send + Sync>) -> Self {
        Subscription(RawSubscription::Arc(arc))
    }
    pub fn from_weak_fn<T: Send + Sync + 'static>(
        this: Weak<T>,
        unsubscribe: impl FnOnce(Arc<T>) + Send + 'static,
    ) -> Self {
        Self::from_fn(move || {
            if let Some(this) = this.upgrade() {
                unsubscribe(this)
            }
        })
    }

    /// Keeps the registration for the rest of the store's life.
    pub fn detach(mut self) {
        self.0 = RawSubscription::Empty;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match take(&mut self.0) {
            RawSubscription::Empty => {}
            RawSubscription::Fn(f) => f(),
            RawSubscription::Arc(_) => {}
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.0 {
            RawSubscription::Empty => "empty",
            RawSubscription::Fn(_) => "fn",
            RawSubscription::Arc(_) => "arc",
        };
        write!(f, "Subscription({kind})")
    }
}

#[derive(Default)]
enum RawSubscription {
    #[default]
    Empty,
    Fn(Box<dyn FnOnce() + Send + 'static>),
    Arc(#[allow(unused)] Arc<dyn Any + Send + Sync>),
}
