//! Type-safe identifiers.
//!
//! Newtype wrappers keep request tokens, listener identities, transport
//! instances and execution contexts from being mixed up.
//!
//! | Type | Source | Purpose |
//! |------|--------|---------|
//! | [`Nonce`] | 30 random alphanumerics | Request/response correlation |
//! | [`ListenerId`] | Process counter | Identity of a message listener |
//! | [`TransportId`] | Process counter | Routes events to a transport instance |
//! | [`ContextId`] | UUID v4 | Identity of an execution context |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Length of generated request tokens.
pub const NONCE_LENGTH: usize = 30;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Nonce
// ============================================================================

/// Opaque token correlating a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Generates a fresh random token of [`NONCE_LENGTH`] alphanumeric chars.
    #[must_use]
    pub fn generate() -> Self {
        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Returns the token as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Nonce {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Nonce {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Identity of a [`Listener`](crate::Listener).
///
/// Clones of a listener share its id, which is what subscription dedup and
/// unsubscribe matching compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates the next process-unique listener id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// TransportId
// ============================================================================

/// Identity of one transport instance.
///
/// Transports are single use, so a new id is allocated for every connection
/// attempt sequence, including every backup created during reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    /// Allocates the next process-unique transport id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

// ============================================================================
// ContextId
// ============================================================================

/// Identity of an execution context taking part in the proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Generates a random context id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
