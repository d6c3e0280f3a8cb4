//! Typed event dispatch.
//!
//! Every component that announces state changes owns an
//! [`EventDispatcher`] parameterized over its own event enumeration:
//!
//! | Enumeration | Emitted by | Consumed by |
//! |-------------|------------|-------------|
//! | [`ClientEvent`] | direct client, proxy consumer | session, proxy host |
//! | [`SessionEvent`] | session | embedding application |
//!
//! Handlers run synchronously on the emitting task, in registration order.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

// ============================================================================
// Events
// ============================================================================

/// Events raised by a client (direct or proxied) towards its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client may be used; for a proxy consumer the host answered the
    /// verification handshake.
    Verified,
    /// The proxy host never answered the verification handshake.
    Unverified,
    /// The underlying connection is ready for requests.
    Connected,
    /// The underlying connection failed unexpectedly.
    Disconnected,
    /// A subscription could not be re-established after a reconnection.
    SubscriptionDropped {
        /// Topic of the dropped subscription.
        topic: String,
    },
}

/// Events raised by a [`Session`](crate::Session) to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session can deliver requests.
    Connected,
    /// The session lost its connection; requests are queued until it returns.
    Disconnected,
    /// Raised right after `Connected` when a disconnect was seen before.
    Reconnected,
    /// A subscription could not be re-established after a reconnection.
    SubscriptionDropped {
        /// Topic of the dropped subscription.
        topic: String,
    },
}

// ============================================================================
// HandlerId
// ============================================================================

/// Registration handle returned by [`EventDispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

// ============================================================================
// EventDispatcher
// ============================================================================

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publish/subscribe helper over a typed event enumeration.
pub struct EventDispatcher<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Handler<E>)>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl<E> EventDispatcher<E> {
    /// Creates a dispatcher with no handlers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    pub fn on(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Invokes every handler with `event`.
    ///
    /// The handler table is snapshotted first, so handlers may register or
    /// remove handlers while being called.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(event);
        }
    }

    /// Returns the number of registered handlers.
    #[inline]
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
