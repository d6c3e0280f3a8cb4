//! Frames exchanged with the pub/sub edge.
//!
//! # Format
//!
//! Outbound:
//! ```json
//! { "type": "PING" }
//! { "type": "LISTEN", "nonce": "…", "data": { "topics": ["chat.123"], "auth_token": "…" } }
//! { "type": "UNLISTEN", "nonce": "…", "data": { "topics": ["chat.123"] } }
//! ```
//!
//! Inbound:
//! ```json
//! { "type": "PONG" }
//! { "type": "RESPONSE", "nonce": "…", "error": "" }
//! { "type": "MESSAGE", "data": { "topic": "chat.123", "message": … } }
//! { "type": "RECONNECT" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::Nonce;

// ============================================================================
// RequestData
// ============================================================================

/// Payload of a LISTEN / UNLISTEN request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// Topics the request applies to. Always a single topic in practice.
    pub topics: Vec<String>,

    /// Opaque credential; omitted on UNLISTEN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl RequestData {
    /// Returns the first topic, or an empty string if there is none.
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topics.first().map(String::as_str).unwrap_or_default()
    }
}

// ============================================================================
// Request
// ============================================================================

/// Kind of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// LISTEN.
    Subscribe,
    /// UNLISTEN.
    Unsubscribe,
}

/// A subscribe/unsubscribe request, independent of how it travels.
///
/// The same request is rendered as an [`OutboundFrame`] on the wire and as a
/// [`ProxyMessage`](super::ProxyMessage) between contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation token.
    pub nonce: Nonce,
    /// LISTEN or UNLISTEN.
    pub kind: RequestKind,
    /// Topic.
    pub topic: String,
    /// Credential, only carried by subscribe requests.
    pub credential: Option<String>,
}

impl Request {
    /// Returns the request payload.
    #[must_use]
    pub fn data(&self) -> RequestData {
        RequestData {
            topics: vec![self.topic.clone()],
            auth_token: match self.kind {
                RequestKind::Subscribe => self.credential.clone(),
                RequestKind::Unsubscribe => None,
            },
        }
    }

    /// Renders the request as a wire frame.
    #[must_use]
    pub fn to_frame(&self) -> OutboundFrame {
        let nonce = self.nonce.clone();
        let data = self.data();
        match self.kind {
            RequestKind::Subscribe => OutboundFrame::Listen { nonce, data },
            RequestKind::Unsubscribe => OutboundFrame::Unlisten { nonce, data },
        }
    }
}

// ============================================================================
// OutboundFrame
// ============================================================================

/// A frame sent to the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OutboundFrame {
    /// Liveness probe.
    Ping,
    /// Subscribe to a topic.
    Listen {
        /// Correlation token.
        nonce: Nonce,
        /// Topic and credential.
        data: RequestData,
    },
    /// Unsubscribe from a topic.
    Unlisten {
        /// Correlation token.
        nonce: Nonce,
        /// Topic.
        data: RequestData,
    },
}

impl OutboundFrame {
    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// InboundFrame
// ============================================================================

/// Topic and payload of a MESSAGE frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageData {
    /// Topic the message was published on.
    pub topic: String,
    /// Message payload, passed through untouched.
    pub message: Value,
}

/// A frame received from the edge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InboundFrame {
    /// Liveness acknowledgement.
    Pong,
    /// Reply to a LISTEN / UNLISTEN.
    Response {
        /// Token of the request being answered.
        nonce: Nonce,
        /// Empty on success.
        #[serde(default)]
        error: String,
    },
    /// A message published on a topic.
    Message {
        /// Topic and payload.
        data: MessageData,
    },
    /// The edge asks the client to move to a new connection.
    Reconnect,
}

impl InboundFrame {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) for malformed or unknown
    /// frames.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
