//! Shared-connection proxy.
//!
//! Several execution contexts can share one upstream connection: the context
//! that owns it runs a [`ProxyHost`], the others run consumers that speak the
//! proxy protocol to it.
//!
//! ```text
//! ┌────────────┐  LISTEN / UNLISTEN   ┌────────────┐        ┌───────────┐
//! │ consumer A │ ───────────────────► │            │        │           │
//! └────────────┘ ◄─────────────────── │ ProxyHost  │ ─────► │  direct   │ ──► edge
//! ┌────────────┐  success / message   │            │        │  client   │
//! │ consumer B │ ◄──────────────────► │            │        │           │
//! └────────────┘                      └────────────┘        └───────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Context mailboxes and handles |
//! | `trust` | Origin trust policy |
//! | `host` | Host actor, refcounting and orphan sweep |
//! | `consumer` | Consumer actor and verify handshake |

// ============================================================================
// Submodules
// ============================================================================

/// Context mailboxes.
pub mod channel;

/// Consumer actor.
pub mod consumer;

/// Host actor.
pub mod host;

/// Origin trust policy.
pub mod trust;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Context, ContextHandle, Delivery};
pub use consumer::{ConsumerConfig, DEFAULT_VERIFY_TIMEOUT, spawn_consumer};
pub use host::{DEFAULT_ORPHAN_SWEEP_INTERVAL, ProxyHost, ProxyHostHandle};
pub use trust::{DEFAULT_TRUSTED_ORIGIN, OriginPolicy};
