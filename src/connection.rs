//! Connection lifecycle state machine.
//!
//! ```text
//!            open()                 setup ok
//! Closed ──────────────► Connecting ────────► Opened
//!   ▲                     │  ▲                 │
//!   │      setup failed   │  │ drop + reconnect│
//!   ├─────────────────────┘  └─────────────────┤
//!   │                                          │ close() / drop
//!   └──────────────── Closing ◄────────────────┘
//! ```
//!
//! [`Lifecycle`] owns the state, the live [`Session`] and the pending-request
//! registry behind one lock. Every transition that ends a session drains
//! the registry inside that lock, so no request can slip in between the
//! state change and the drain. State changes are published on a
//! `tokio::sync::watch` channel.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::codec::MessageKind;
use crate::correlation::{IndicationReceiver, PendingRegistry, ResponseReceiver};
use crate::error::{Result, S7Error};
use crate::protocol::Frame;
use crate::writer::WriterHandle;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Opened,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Opened => "opened",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One established connection: writer queue, negotiated values, tasks.
#[derive(Debug)]
pub struct Session {
    pub generation: u64,
    pub writer: WriterHandle,
    /// Negotiated PDU size.
    pub pdu_size: u16,
    /// Negotiated parallel job count.
    pub capacity: u16,
    tasks: Vec<AbortHandle>,
}

impl Session {
    pub fn new(generation: u64, writer: WriterHandle, pdu_size: u16, capacity: u16) -> Self {
        Self {
            generation,
            writer,
            pdu_size,
            capacity,
            tasks: Vec::new(),
        }
    }

    /// Attach a background task that is aborted on teardown.
    pub fn attach(&mut self, task: AbortHandle) {
        self.tasks.push(task);
    }

    /// Stop the session's tasks. Dropping the writer handle ends the writer.
    pub fn teardown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Writer access for one request.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub generation: u64,
    pub writer: WriterHandle,
    pub pdu_size: u16,
}

struct Link {
    state: ConnectionState,
    session: Option<Session>,
    registry: PendingRegistry,
    generation: u64,
}

/// Shared connection state, session and registry.
pub struct Lifecycle {
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Lifecycle {
    /// Create a lifecycle in the `Closed` state.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            link: Mutex::new(Link {
                state: ConnectionState::Closed,
                session: None,
                registry: PendingRegistry::new(),
                generation: 0,
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        match self.link.lock() {
            Ok(link) => link,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, link: &mut Link, state: ConnectionState) {
        if link.state != state {
            tracing::debug!(from = %link.state, to = %state, "Connection state changed");
        }
        link.state = state;
        self.state_tx.send_replace(state);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start a first connection attempt from `Closed` and return its
    /// generation.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut link = self.lock();
        if link.state != ConnectionState::Closed {
            return None;
        }
        Some(self.next_generation(&mut link))
    }

    /// Start a reconnect attempt following generation `previous`.
    ///
    /// Needs `Connecting` without a session, and `previous` must still be
    /// the latest generation: a reconnect loop left over from before a
    /// `close()` never takes over a newer `open()`.
    pub fn begin_reconnect(&self, previous: u64) -> Option<u64> {
        let mut link = self.lock();
        if link.state != ConnectionState::Connecting
            || link.session.is_some()
            || link.generation != previous
        {
            return None;
        }
        Some(self.next_generation(&mut link))
    }

    fn next_generation(&self, link: &mut Link) -> u64 {
        link.generation += 1;
        self.publish(link, ConnectionState::Connecting);
        link.generation
    }

    /// Install an established session.
    ///
    /// Hands the session back if the attempt was superseded (closed or a
    /// newer attempt started) so the caller can tear it down.
    pub fn opened(&self, session: Session) -> std::result::Result<(), Session> {
        let mut link = self.lock();
        if link.state != ConnectionState::Connecting || link.generation != session.generation {
            return Err(session);
        }
        link.session = Some(session);
        self.publish(&mut link, ConnectionState::Opened);
        Ok(())
    }

    /// Record a failed attempt; stays `Connecting` when `retry` is set.
    pub fn connect_failed(&self, generation: u64, retry: bool) {
        let mut link = self.lock();
        if link.state == ConnectionState::Connecting && link.generation == generation {
            let next = if retry {
                ConnectionState::Connecting
            } else {
                ConnectionState::Closed
            };
            self.publish(&mut link, next);
        }
    }

    /// Handle an unsolicited loss of the session with `generation`.
    ///
    /// Drains the registry and moves to `Connecting` (when `reconnect` is
    /// set) or `Closed`. Returns false when the session is already gone.
    pub fn connection_lost(&self, generation: u64, reconnect: bool) -> bool {
        let session = {
            let mut link = self.lock();
            let current = link
                .session
                .as_ref()
                .is_some_and(|session| session.generation == generation);
            if link.state != ConnectionState::Opened || !current {
                return false;
            }
            let session = link.session.take();
            let drained = link.registry.drain();
            let next = if reconnect {
                ConnectionState::Connecting
            } else {
                ConnectionState::Closed
            };
            self.publish(&mut link, next);
            tracing::debug!(generation, drained, reconnect, "Connection lost");
            session
        };

        if let Some(session) = session {
            session.teardown();
        }
        true
    }

    /// Begin an intentional close: drain and hand out the session.
    ///
    /// Returns `None` without a transition when already closed.
    pub fn begin_close(&self) -> Option<Option<Session>> {
        let mut link = self.lock();
        if link.state == ConnectionState::Closed {
            return None;
        }
        let session = link.session.take();
        link.registry.drain();
        self.publish(&mut link, ConnectionState::Closing);
        Some(session)
    }

    /// Complete an intentional close.
    pub fn finish_close(&self) {
        let mut link = self.lock();
        self.publish(&mut link, ConnectionState::Closed);
    }

    /// Writer access for a request; `NotConnected` unless `Opened`.
    pub fn session(&self) -> Result<SessionHandle> {
        let link = self.lock();
        match (&link.state, &link.session) {
            (ConnectionState::Opened, Some(session)) => Ok(SessionHandle {
                generation: session.generation,
                writer: session.writer.clone(),
                pdu_size: session.pdu_size,
            }),
            _ => Err(S7Error::NotConnected),
        }
    }

    /// Negotiated `(pdu_size, capacity)` of the live session.
    pub fn negotiated(&self) -> Option<(u16, u16)> {
        self.lock()
            .session
            .as_ref()
            .map(|session| (session.pdu_size, session.capacity))
    }

    /// Generation of the live session.
    pub fn generation(&self) -> Option<u64> {
        self.lock().session.as_ref().map(|session| session.generation)
    }

    /// Register a waiter; `NotConnected` unless `Opened`.
    pub fn register(&self, id: u16, expected: MessageKind) -> Result<(u64, ResponseReceiver)> {
        let mut link = self.lock();
        if link.state != ConnectionState::Opened {
            return Err(S7Error::NotConnected);
        }
        link.registry.register(id, expected)
    }

    pub fn resolve(&self, id: u16, kind: MessageKind, frame: Frame) -> bool {
        self.lock().registry.resolve(id, kind, frame)
    }

    pub fn fail(&self, id: u16, error: S7Error) -> bool {
        self.lock().registry.fail(id, error)
    }

    pub fn deregister(&self, id: u16, token: u64) -> bool {
        self.lock().registry.deregister(id, token)
    }

    /// Number of in-flight requests.
    pub fn pending(&self) -> usize {
        self.lock().registry.len()
    }

    /// Add an indication subscriber; `NotConnected` unless `Opened`.
    pub fn subscribe(&self, capacity: usize) -> Result<(u64, IndicationReceiver)> {
        let mut link = self.lock();
        if link.state != ConnectionState::Opened {
            return Err(S7Error::NotConnected);
        }
        Ok(link.registry.subscribe(capacity))
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.lock().registry.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().registry.subscriber_count()
    }

    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.lock().registry.broadcast(frame)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
