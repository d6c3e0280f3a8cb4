//! Seamless reconnection.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `coordinator` | Sans-IO primary/backup state machine |
//! | `direct` | Actor running a coordinator over WebSocket transports |

// ============================================================================
// Submodules
// ============================================================================

/// Primary/backup transport coordination.
pub mod coordinator;

/// Direct client actor.
pub mod direct;

// ============================================================================
// Re-exports
// ============================================================================

pub use coordinator::{Coordinator, CoordinatorConfig, DEFAULT_RECONNECT_JITTER};
pub use direct::spawn_direct;
