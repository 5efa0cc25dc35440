//! Sleep and timeout helpers that do not depend on an async runtime.
//!
//! A single background thread owns the deadline queue and wakes sleeping futures when their
//! deadline is reached. The flush loop of a [`Store`](crate::Store) sleeps through these helpers,
//! so stores work with any executor implementing [`Spawn`](futures::task::Spawn).

use std::{
    collections::BTreeMap,
    future::Future,
    pin::{Pin, pin},
    sync::{Condvar, LazyLock, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use futures::future::{Either, select};
use parse_display::Display;
use slabmap::SlabMap;

pub use statetree_macros::timeout;


static DEADLINES: LazyLock<Deadlines> = LazyLock::new(|| Deadlines {
    queue: Mutex::new(DeadlineQueue::new()),
    changed: Condvar::new(),
});

struct Deadlines {
    queue: Mutex<DeadlineQueue>,
    changed: Condvar,
}

impl Deadlines {
    fn lock(&self) -> MutexGuard<'_, DeadlineQueue> {
        self.queue.lock().unwrap()
    }

    fn run_worker(&self) {
        let mut due = Vec::new();
        let mut queue = self.lock();
        loop {
            let now = Instant::now();
            queue.take_due(now, &mut due);
            if !due.is_empty() {
                drop(queue);
                for waker in due.drain(..) {
                    waker.wake();
                }
                queue = self.lock();
                continue;
            }
            queue = match queue.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    self.changed.wait_timeout(queue, wait).unwrap().0
                }
                None => self.changed.wait(queue).unwrap(),
            };
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineKey {
    at: Instant,
    seq: u64,
}

struct Sleeper {
    key: DeadlineKey,
    waker: Waker,
}

struct DeadlineQueue {
    order: BTreeMap<DeadlineKey, usize>,
    sleepers: SlabMap<Option<Sleeper>>,
    next_seq: u64,
    worker_started: bool,
}

impl DeadlineQueue {
    fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            sleepers: SlabMap::new(),
            next_seq: 0,
            worker_started: false,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.order.first_key_value().map(|(key, _)| key.at)
    }

    fn take_due(&mut self, now: Instant, to: &mut Vec<Waker>) {
        while let Some(entry) = self.order.first_entry() {
            if entry.key().at > now {
                break;
            }
            let id = entry.remove();
            if let Some(sleeper) = self.sleepers[id].take() {
                to.push(sleeper.waker);
            }
        }
    }

    fn insert(&mut self, at: Instant, waker: Waker) -> usize {
        if !self.worker_started {
            self.worker_started = true;
            std::thread::spawn(|| DEADLINES.run_worker());
        }
        let key = DeadlineKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let is_earliest = self.order.first_key_value().is_none_or(|(first, _)| key < *first);
        let id = self.sleepers.insert(Some(Sleeper { key, waker }));
        self.order.insert(key, id);
        if is_earliest {
            DEADLINES.changed.notify_one();
        }
        id
    }

    fn poll(&mut self, id: usize, cx: &Context) -> Poll<()> {
        match &mut self.sleepers[id] {
            Some(sleeper) => {
                if !sleeper.waker.will_wake(cx.waker()) {
                    sleeper.waker = cx.waker().clone();
                }
                Poll::Pending
            }
            None => {
                self.sleepers.remove(id);
                Poll::Ready(())
            }
        }
    }

    fn cancel(&mut self, id: usize) {
        if let Some(Some(sleeper)) = self.sleepers.remove(id) {
            self.order.remove(&sleeper.key);
        }
    }
}

struct Sleep {
    id: Option<usize>,
}

impl Sleep {
    fn until(at: Instant) -> Self {
        let id = (at > Instant::now()).then(|| DEADLINES.lock().insert(at, Waker::noop().clone()));
        Self { id }
    }
}

impl Future for Sleep {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(id) = this.id else {
            return Poll::Ready(());
        };
        let poll = DEADLINES.lock().poll(id, cx);
        if poll.is_ready() {
            this.id = None;
        }
        poll
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            DEADLINES.lock().cancel(id);
        }
    }
}

/// Completes after `duration` has elapsed.
pub async fn sleep(duration: Duration) {
    Sleep::until(Instant::now() + duration).await
}

/// Completes once `at` is reached.
pub async fn sleep_until(at: Instant) {
    Sleep::until(at).await
}

#[derive(Debug, Display, PartialEq, Eq)]
#[display("timeout")]
pub struct TimeoutError {
    _private: (),
}
impl TimeoutError {
    fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for TimeoutError {}

/// Awaits `fut`, giving up after `duration`.
pub async fn with_timeout_async<T>(
    fut: impl Future<Output = T>,
    duration: Duration,
) -> Result<T, TimeoutError> {
    let fut = pin!(fut);
    let timeout = pin!(sleep(duration));
    match select(fut, timeout).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(_) => Err(TimeoutError::new()),
    }
}

/// Runs `f` on a new thread, giving up after `duration`.
///
/// The thread keeps running after a timeout; only the caller stops waiting.
pub fn with_timeout<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
    duration: Duration,
) -> Result<T, TimeoutError> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(duration).map_err(|_| TimeoutError::new())
}

/// Values accepted by [`timeout`].
pub trait IntoTimeoutDuration {
    fn into_timeout_duration(self) -> Duration;
}
impl IntoTimeoutDuration for Duration {
    fn into_timeout_duration(self) -> Duration {
        self
    }
}
impl IntoTimeoutDuration for &str {
    fn into_timeout_duration(self) -> Duration {
        parse_duration(self).unwrap_or_else(|e| panic!("{e}: `{self}`"))
    }
}
impl IntoTimeoutDuration for String {
    fn into_timeout_duration(self) -> Duration {
        self.as_str().into_timeout_duration()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display("{0}")]
pub struct ParseDurationError(&'static str);

impl std::error::Error for ParseDurationError {}

/// Parses `"250ms"`, `"2s"` or `"1.5m"`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let s = s.trim();
    let (number, to_secs): (&str, fn(f64) -> f64) = if let Some(n) = s.strip_suffix("ms") {
        (n, |v| v / 1000.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, |v| v)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |v| v * 60.0)
    } else {
        return Err(ParseDurationError("invalid duration literal"));
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| ParseDurationError("invalid duration number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseDurationError("duration must be non-negative and finite"));
    }
    Ok(Duration::from_secs_f64(to_secs(value)))
}
