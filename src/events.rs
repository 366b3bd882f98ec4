/// file: src/events.rs
/// description: typed event hub decoupling Data instances from their consumers
use crate::types::{CellBatch, Connection, Meta};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;

/// Events a Data instance fires to grids, clipboards and pooled children.
#[derive(Debug, Clone)]
pub enum DataEvent {
    Meta {
        meta: Arc<Meta>,
        connection: Connection,
    },
    // Arc so fan-out to several listeners does not copy the cells
    Data(Arc<CellBatch>),
    Cycle {
        duration_ms: u64,
    },
    Types {
        portfolio: bool,
        primitives: bool,
    },
    Fatal(String),
    Disconnect,
}

impl DataEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DataEvent::Meta { .. } => "meta",
            DataEvent::Data(_) => "data",
            DataEvent::Cycle { .. } => "cycle",
            DataEvent::Types { .. } => "types",
            DataEvent::Fatal(_) => "fatal",
            DataEvent::Disconnect => "disconnect",
        }
    }
}

pub type EventSender<E> = mpsc::UnboundedSender<E>;
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Fan-out of one event stream to any number of listeners.
///
/// Unbounded on purpose: `fire` runs inside the owning actor and must never wait
/// on a slow consumer, and batches may not be dropped.
#[derive(Debug)]
pub struct EventHub<E> {
    listeners: Mutex<Vec<(ListenerId, EventSender<E>)>>,
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self) -> (ListenerId, EventReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, tx));
        (id, rx)
    }

    /// Returns false if the listener was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    /// Delivers to every live listener, pruning the ones whose receiver is gone.
    /// Returns the number of listeners reached.
    pub fn fire(&self, event: E) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        listeners.len()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
