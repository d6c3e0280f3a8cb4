//! Request correlation, queuing and listener bookkeeping.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`Listener`] | Message callback with a stable identity |
//! | [`ListenerRegistry`] | topic → ordered listeners, with `count` |
//! | [`PendingRequests`] | token → request awaiting a response |
//! | [`ReplayRecords`] | acknowledged subscriptions to re-issue after a reconnect |
//! | [`Correlator`] | the state machine tying them together |

// ============================================================================
// Submodules
// ============================================================================

/// Request/response correlation state machine.
pub mod correlator;

/// Outstanding requests and replay records.
pub mod pending;

/// Topic → listener registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use correlator::{Correlator, DEFAULT_RESPONSE_TIMEOUT};
pub use pending::{PendingRequest, PendingRequests, ReplayRecord, ReplayRecords};
pub use registry::{Listener, ListenerRegistry};

// ============================================================================
// Completion
// ============================================================================

use crate::error::Result;

/// Callback invoked exactly once with the outcome of a request.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;
