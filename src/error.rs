//! Error types for the pub/sub client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use pubsub_client::{Listener, Result, Session};
//!
//! async fn example(session: &Session) -> Result<()> {
//!     let listener = Listener::new(|payload| println!("{payload}"));
//!     session.subscribe("chat.123", "token", &listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Request | [`Error::NotReady`], [`Error::ResponseTimeout`], [`Error::ServerRejected`] |
//! | Connection | [`Error::ConnectionFailure`], [`Error::ConnectionClosed`], [`Error::ChannelClosed`] |
//! | Configuration | [`Error::Config`], [`Error::Url`], [`Error::Regex`] |
//! | Protocol | [`Error::Protocol`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::Nonce;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Request Errors
    // ========================================================================
    /// No open transport to send on.
    ///
    /// Raised synchronously by a send attempt; never queued.
    #[error("Transport not ready")]
    NotReady,

    /// No response arrived for a request in time.
    #[error("Request {nonce} timed out after {timeout_ms}ms")]
    ResponseTimeout {
        /// The token of the request that timed out.
        nonce: Nonce,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The server (or the proxy host) rejected the request.
    #[error("Server rejected request: {message}")]
    ServerRejected {
        /// The error string reported by the remote end.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The connection a request was to travel on is gone.
    #[error("Connection failure: {message}")]
    ConnectionFailure {
        /// Description of the failure.
        message: String,
    },

    /// The client was shut down while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An internal channel closed before a reply was produced.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Address could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Trusted-origin pattern could not be compiled.
    #[error("Invalid origin pattern: {0}")]
    Regex(#[from] regex::Error),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// ErrorKind
// ============================================================================

/// Coarse classification of an [`enum@Error`], for callers that only branch on
/// the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::NotReady`].
    NotReady,
    /// See [`Error::ResponseTimeout`].
    ResponseTimeout,
    /// Connection-level failures, including shutdown.
    ConnectionFailure,
    /// See [`Error::ServerRejected`].
    ServerRejected,
    /// Configuration errors.
    Config,
    /// Framing, serialization and socket errors.
    Protocol,
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a response timeout error.
    #[inline]
    pub fn response_timeout(nonce: Nonce, timeout_ms: u64) -> Self {
        Self::ResponseTimeout { nonce, timeout_ms }
    }

    /// Creates a server rejection error.
    #[inline]
    pub fn server_rejected(message: impl Into<String>) -> Self {
        Self::ServerRejected {
            message: message.into(),
        }
    }

    /// Creates a connection failure error.
    #[inline]
    pub fn connection_failure(message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady => ErrorKind::NotReady,
            Self::ResponseTimeout { .. } => ErrorKind::ResponseTimeout,
            Self::ServerRejected { .. } => ErrorKind::ServerRejected,
            Self::ConnectionFailure { .. } | Self::ConnectionClosed | Self::ChannelClosed(_) => {
                ErrorKind::ConnectionFailure
            }
            Self::Config { .. } | Self::Url(_) | Self::Regex(_) => ErrorKind::Config,
            Self::Protocol { .. } | Self::Json(_) | Self::WebSocket(_) => ErrorKind::Protocol,
        }
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotReady
                | Self::ConnectionFailure { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when the request is issued again.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotReady | Self::ResponseTimeout { .. } | Self::ConnectionFailure { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
