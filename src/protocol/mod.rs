//! Message types.
//!
//! This module defines the two schemas the client speaks.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `OutboundFrame` | Client → Edge | PING, LISTEN, UNLISTEN |
//! | `InboundFrame` | Edge → Client | PONG, RESPONSE, MESSAGE, RECONNECT |
//! | `ProxyMessage` | Consumer ↔ Host | Shared-connection proxy protocol |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `wire` | Edge frames and the transport-neutral `Request` |
//! | `proxy` | Cross-context messages and the protocol marker |

// ============================================================================
// Submodules
// ============================================================================

/// Cross-context proxy messages.
pub mod proxy;

/// Edge wire frames.
pub mod wire;

// ============================================================================
// Re-exports
// ============================================================================

pub use proxy::{PROTOCOL_FIELD, PROTOCOL_MARKER, ProxyMessage};
pub use wire::{InboundFrame, MessageData, OutboundFrame, Request, RequestData, RequestKind};
