//! Pub/sub edge client - resilient topic subscriptions over WebSocket.
//!
//! This library keeps an application subscribed to topics on a pub/sub edge
//! server through connection loss, server-requested migrations and shared
//! connections between execution contexts.
//!
//! # Architecture
//!
//! ```text
//! Session ──► client (direct) ──► Coordinator ──► Transport ──► edge
//!    │                                 │
//!    └──► client (proxied) ──► ProxyHost (another context) ──► direct client
//! ```
//!
//! Key design principles:
//!
//! - Every stateful component is a tokio task owning its state
//! - Each request carries a random nonce, a deadline and a one-shot completion
//! - A reconnection dials a backup connection, replays every subscription on
//!   it and swaps only once all replays answered
//! - A wire unsubscribe is sent only when the last listener of a topic leaves
//! - Contexts sharing a connection through a proxy host subscribe each topic
//!   upstream at most once per context
//!
//! # Quick Start
//!
//! ```no_run
//! use pubsub_client::{Listener, Result, Session, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::builder().build()?;
//!     session.on_event(|event: &SessionEvent| println!("session: {event:?}"));
//!
//!     let listener = Listener::new(|payload| println!("message: {payload}"));
//!     session.subscribe("video-playback.1234", "token", &listener).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     session.unsubscribe("video-playback.1234", &listener).await?;
//!     session.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`session`] | [`Session`], [`SessionBuilder`], [`SessionRegistry`] |
//! | [`correlation`] | Nonce correlation, listener registry, replay records |
//! | [`reconnect`] | Reconnection coordinator and direct client |
//! | [`proxy`] | Shared-connection host and consumer |
//! | [`transport`] | WebSocket transport with heartbeat and backoff |
//! | [`protocol`] | Wire and proxy message types |
//! | [`events`] | Typed event dispatch |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Client actor handle shared by direct and proxied clients.
pub mod client;

/// Monotonic clock helpers for actor loops.
pub mod clock;

/// Request correlation and listener bookkeeping.
///
/// Every request goes through a [`Correlator`](correlation::Correlator):
/// it owns the nonce table, the per-topic listener registry and the replay
/// records used after a reconnection.
pub mod correlation;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Typed event dispatch.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire and proxy protocol message types.
pub mod protocol;

/// Shared-connection proxy between execution contexts.
pub mod proxy;

/// Reconnection coordinator and direct client actor.
pub mod reconnect;

/// Caller-facing sessions.
///
/// Use [`Session::builder()`] to create a configured session.
pub mod session;

/// WebSocket transport layer.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Session types
pub use session::{Environment, Session, SessionBuilder, SessionConfig, SessionRegistry};

// Client types
pub use client::{ClientHandle, ClientKind};

// Correlation types
pub use correlation::Listener;

// Event types
pub use events::{ClientEvent, EventDispatcher, HandlerId, SessionEvent};

// Proxy types
pub use proxy::{Context, ContextHandle, OriginPolicy};

// Error types
pub use error::{Error, ErrorKind, Result};

// Identifier types
pub use identifiers::{ContextId, ListenerId, Nonce, TransportId};
