use std::{
    any::Any,
    fmt::{self, Debug},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bitflags::bitflags;
use futures::{
    Stream, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::ready,
};
use slabmap::SlabMap;

use crate::{call_context::BatchContext, core::NodeId, lens::LensId};


bitflags! {
    /// Which scopes receive an event, relative to the scope that sends it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Receivers: u8 {
        const SELF = 1 << 0;
        const PARENT = 1 << 1;
        const ANCESTORS = 1 << 2;
        const CHILDREN = 1 << 3;
        const DESCENDANTS = 1 << 4;
    }
}

impl Default for Receivers {
    fn default() -> Self {
        Receivers::SELF | Receivers::ANCESTORS
    }
}

/// An event raised by a scope.
#[derive(Clone)]
pub struct Event {
    payload: Arc<dyn Any + Send + Sync>,
    origin_path: LensId,
    origin: NodeId,
    batch: BatchContext,
}

impl Event {
    pub(crate) fn new(
        payload: Arc<dyn Any + Send + Sync>,
        origin_path: LensId,
        origin: NodeId,
        batch: BatchContext,
    ) -> Self {
        Self {
            payload,
            origin_path,
            origin,
            batch,
        }
    }

    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        &*self.payload
    }
    pub fn is<E: Any>(&self) -> bool {
        self.payload.is::<E>()
    }
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }
    pub fn downcast<E: Any + Send + Sync>(&self) -> Option<Arc<E>> {
        self.payload.clone().downcast().ok()
    }

    /// Path from the root to the scope that sent the event.
    pub fn origin_path(&self) -> &LensId {
        &self.origin_path
    }
    pub fn origin(&self) -> NodeId {
        self.origin
    }
    pub fn batch(&self) -> &BatchContext {
        &self.batch
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("origin_path", &self.origin_path)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Fan-out channel of one scope: every live receiver sees every event.
#[derive(Default)]
pub(crate) struct Broadcast {
    senders: SlabMap<UnboundedSender<Event>>,
}

impl Broadcast {
    pub fn subscribe(&mut self) -> EventReceiver {
        let (tx, rx) = unbounded();
        self.senders.insert(tx);
        EventReceiver { rx }
    }

    pub fn send(&mut self, event: &Event) {
        let mut closed = Vec::new();
        for (key, tx) in self.senders.iter() {
            if tx.unbounded_send(event.clone()).is_err() {
                closed.push(key);
            }
        }
        for key in closed {
            self.senders.remove(key);
        }
    }

    /// Whether any receiver is still alive.
    pub fn has_receivers(&self) -> bool {
        self.senders.values().any(|tx| !tx.is_closed())
    }

    pub fn close(&mut self) {
        for (_, tx) in std::mem::take(&mut self.senders) {
            tx.close_channel();
        }
    }
}

/// Receiving end of a scope's event channel.
///
/// The stream ends when the scope is torn down.
pub struct EventReceiver {
    rx: UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drains every queued event.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Returns the next queued event carrying an `E`, discarding other events before it.
    pub fn try_recv_of<E: Any + Send + Sync>(&mut self) -> Option<Arc<E>> {
        while let Some(event) = self.try_recv() {
            if let Some(payload) = event.downcast::<E>() {
                return Some(payload);
            }
        }
        None
    }

    /// Only the events carrying an `E`.
    pub fn typed<E: Any + Send + Sync>(self) -> impl Stream<Item = (Arc<E>, Event)> + Send {
        self.filter_map(|event| ready(event.downcast::<E>().map(|payload| (payload, event))))
    }
}

impl Stream for EventReceiver {
    type Item = Event;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_next_unpin(cx)
    }
}
