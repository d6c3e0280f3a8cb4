//! WebSocket transport layer.
//!
//! A [`Transport`] owns exactly one duplex connection to the edge and turns
//! raw socket activity into typed [`TransportEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──connect()──► Connecting ──open──► Open ──close()──► Closing ──► Closed
//!                          │  ▲                │
//!                          └──┘ backoff         └── socket lost / PONG missed ──► Closed
//! ```
//!
//! A transport is single use: once closed it is discarded and a new one is
//! dialed.
//!
//! # Seams
//!
//! | Trait | Implemented by | Used by |
//! |-------|----------------|---------|
//! | [`RequestSink`] | transports, proxy host channel | `Correlator` |
//! | [`Link`] | [`Transport`] | `Coordinator` |
//! | [`Dialer`] | [`WsDialer`] | `Coordinator` |

// ============================================================================
// Submodules
// ============================================================================

/// Reconnection delay policy.
pub mod backoff;

/// WebSocket connection, heartbeat and event loop.
pub mod connection;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::Result;
use crate::identifiers::TransportId;
use crate::protocol::{InboundFrame, OutboundFrame, Request};

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_PONG_TIMEOUT,
    Transport, TransportConfig, WsDialer,
};

// ============================================================================
// TransportState
// ============================================================================

/// Lifecycle state of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, `connect` not called yet.
    Idle,
    /// Dialing, possibly between backoff retries.
    Connecting,
    /// Connected; frames can be sent.
    Open,
    /// `close` requested, socket not yet closed.
    Closing,
    /// Finished. Never reopened.
    Closed,
}

// ============================================================================
// TransportEvent
// ============================================================================

/// What happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Connection established.
    Opened,
    /// A RESPONSE, MESSAGE or RECONNECT frame arrived.
    Frame(InboundFrame),
    /// A liveness probe went unanswered; the transport is closing.
    HeartbeatMissed,
    /// Connection lost without `close` being requested.
    ClosedUnexpectedly,
    /// Connection closed after `close`.
    ClosedIntentionally,
}

/// An event tagged with the transport it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Source transport.
    pub transport: TransportId,
    /// What happened.
    pub kind: TransportEventKind,
}

impl TransportEvent {
    /// Creates an event.
    #[inline]
    #[must_use]
    pub fn new(transport: TransportId, kind: TransportEventKind) -> Self {
        Self { transport, kind }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Something a correlated request can be sent through.
pub trait RequestSink {
    /// Sends `request` or fails synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`](crate::Error::NotReady) when there is no
    /// open channel to send on.
    fn send_request(&self, request: &Request) -> Result<()>;
}

/// One connection instance, as seen by the reconnection coordinator.
pub trait Link: RequestSink {
    /// Identity used to route this link's events.
    fn id(&self) -> TransportId;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Returns `true` when frames can be sent.
    fn is_ready(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Starts connecting after `delay`. No-op unless idle.
    fn connect(&mut self, delay: Duration);

    /// Sends a frame or fails synchronously with `NotReady`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`](crate::Error::NotReady) unless open.
    fn send(&self, frame: &OutboundFrame) -> Result<()>;

    /// Closes intentionally; reported as `ClosedIntentionally`.
    fn close(&mut self);

    /// Closes silently because the owner is going away.
    fn abandon(&mut self);
}

/// Factory for new links.
pub trait Dialer {
    /// Link type produced.
    type Link: Link;

    /// Creates an idle link to the configured address.
    fn dial(&mut self) -> Self::Link;
}
