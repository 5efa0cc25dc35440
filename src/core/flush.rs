use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};

use super::{RootShared, State};
use crate::utils::timer::sleep;

/// Starts the coalescing loop of `root`; returns the channel that wakes it when a batch starts.
///
/// Returns `None` if the loop could not be spawned, in which case writes are published
/// immediately.
pub(super) fn start<S: State>(
    root: &Arc<RootShared<S>>,
    poll_interval: Duration,
    max_wait: Duration,
) -> Option<UnboundedSender<()>> {
    let (tx, rx) = unbounded();
    let task = run(Arc::downgrade(root), rx, poll_interval, max_wait);
    match root.core().spawn(task) {
        Ok(()) => Some(tx),
        Err(e) => {
            tracing::error!(error = %e, "failed to start the flush loop; publishing every write");
            None
        }
    }
}

async fn run<S: State>(
    root: Weak<RootShared<S>>,
    mut wakeups: UnboundedReceiver<()>,
    poll_interval: Duration,
    max_wait: Duration,
) {
    while wakeups.next().await.is_some() {
        loop {
            let Some(shared) = root.upgrade() else {
                return;
            };
            let Some(wait) = shared.flush_due(Instant::now(), poll_interval, max_wait) else {
                break;
            };
            if wait.is_zero() {
                shared.flush();
                break;
            }
            drop(shared);
            sleep(wait).await;
        }
    }
}
