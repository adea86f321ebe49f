//! Event dispatch from engine tasks to presentation-side consumers.
//!
//! Sessions run their network handling on tokio tasks; whatever renders
//! status and messages (a UI frame loop, a console drain) runs in its own
//! single-threaded turn. The [`EventDispatcher`] sits between the two: every
//! session posts through a [`DispatchHandle`] bound at construction, and any
//! number of consumers pull from independent [`EventStream`]s.
//!
//! Guarantees:
//! - `post` never blocks a producer task.
//! - Events from one session arrive at each consumer in posting order.
//! - A consumer that dropped its stream is skipped silently; posting to a
//!   torn-down consumer is never an error on the producer side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::session::{ConnectionState, Message};

/// Process-unique identifier tagging every event with its origin session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Allocates the next id. Ids are never reused within a process.
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a session reports to its consumers.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The session's [`ConnectionState`] changed (both lifecycles).
    StateChanged {
        session: SessionId,
        state: ConnectionState,
    },
    /// A client completed the CONNECT handshake (broker side).
    ClientConnected {
        session: SessionId,
        client_id: String,
    },
    /// A client connection ended (broker side).
    ClientDisconnected {
        session: SessionId,
        client_id: String,
        reason: String,
    },
    /// An application message arrived.
    MessageReceived {
        session: SessionId,
        message: Message,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::StateChanged { session, .. }
            | SessionEvent::ClientConnected { session, .. }
            | SessionEvent::ClientDisconnected { session, .. }
            | SessionEvent::MessageReceived { session, .. } => *session,
        }
    }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>;

fn lock_subscribers(subscribers: &Subscribers) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<SessionEvent>>> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out hub owned by the application wiring.
///
/// `subscribe()` hands out consumer streams, `handle()` hands out the
/// producer side given to sessions. Dropping the dispatcher ends all streams
/// once the remaining handles are gone.
pub struct EventDispatcher {
    subscribers: Subscribers,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Producer handle for sessions. Cheap to clone.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Registers a new independent consumer.
    ///
    /// Every event posted after this call is delivered to the stream;
    /// consumers never steal events from each other.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_subscribers(&self.subscribers).push(tx);
        EventStream { rx }
    }

    /// Live consumer count, as of the most recent post's pruning.
    pub fn subscriber_count(&self) -> usize {
        lock_subscribers(&self.subscribers).len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side handed to sessions at construction.
#[derive(Clone)]
pub struct DispatchHandle {
    subscribers: Subscribers,
}

impl DispatchHandle {
    /// Enqueues an event for every live consumer without blocking.
    ///
    /// Streams whose consumer is gone are pruned here; the drop is silent.
    pub fn post(&self, event: SessionEvent) {
        trace!("dispatching event from session {}", event.session());
        let mut subscribers = lock_subscribers(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Consumer end: a private FIFO of [`SessionEvent`]s.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    /// Waits for the next event. `None` once the dispatcher and all
    /// producer handles are gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for one event, for frame-loop style consumers.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drains everything currently queued, preserving order.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            drained.push(event);
        }
        drained
    }
}
