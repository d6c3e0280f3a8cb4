//! Messages exchanged between a proxy host and its consumers.
//!
//! Contexts share an untyped channel, so every message carries the protocol
//! marker field. Payloads without it belong to someone else and are ignored.
//!
//! # Format
//!
//! ```json
//! { "pubsub_protocol": "pubsub", "type": "LISTEN", "nonce": "…", "data": { … } }
//! { "pubsub_protocol": "pubsub", "type": "success", "nonce": "…" }
//! { "pubsub_protocol": "pubsub", "type": "message", "topic": "…", "message": … }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::Nonce;

use super::wire::{Request, RequestData, RequestKind};

// ============================================================================
// Constants
// ============================================================================

/// Field carrying the protocol marker.
pub const PROTOCOL_FIELD: &str = "pubsub_protocol";

/// Marker value identifying this protocol.
pub const PROTOCOL_MARKER: &str = "pubsub";

// ============================================================================
// ProxyMessage
// ============================================================================

/// A proxy protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProxyMessage {
    /// Consumer → host: start serving me.
    #[serde(rename = "connect")]
    Connect,

    /// Both ways: trust handshake request and its echo.
    #[serde(rename = "verify")]
    Verify,

    /// Host → consumer: upstream connection is ready.
    #[serde(rename = "connected")]
    Connected,

    /// Host → consumer: upstream connection failed.
    #[serde(rename = "disconnected")]
    Disconnected,

    /// Consumer → host: subscribe.
    #[serde(rename = "LISTEN")]
    Listen {
        /// Correlation token.
        nonce: Nonce,
        /// Topic and credential.
        data: RequestData,
    },

    /// Consumer → host: unsubscribe.
    #[serde(rename = "UNLISTEN")]
    Unlisten {
        /// Correlation token.
        nonce: Nonce,
        /// Topic.
        data: RequestData,
    },

    /// Host → consumer: request succeeded.
    #[serde(rename = "success")]
    Success {
        /// Token of the request being answered.
        nonce: Nonce,
    },

    /// Host → consumer: request failed.
    #[serde(rename = "failure")]
    Failure {
        /// Token of the request being answered.
        nonce: Nonce,
        /// Failure description.
        #[serde(default)]
        error: String,
    },

    /// Host → consumer: a message published on a subscribed topic.
    #[serde(rename = "message")]
    Message {
        /// Topic.
        topic: String,
        /// Payload.
        message: Value,
    },
}

impl ProxyMessage {
    /// Renders a correlated request as a proxy message.
    #[must_use]
    pub fn from_request(request: &Request) -> Self {
        let nonce = request.nonce.clone();
        let data = request.data();
        match request.kind {
            RequestKind::Subscribe => Self::Listen { nonce, data },
            RequestKind::Unsubscribe => Self::Unlisten { nonce, data },
        }
    }

    /// Encodes the message with the protocol marker attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        let Value::Object(map) = &mut value else {
            return Err(Error::protocol("proxy message must encode to an object"));
        };
        map.insert(
            PROTOCOL_FIELD.to_string(),
            Value::String(PROTOCOL_MARKER.to_string()),
        );
        Ok(value)
    }

    /// Decodes a payload received from another context.
    ///
    /// Returns `None` when the payload does not carry the protocol marker or
    /// does not match the schema; such payloads are not ours to interpret.
    #[must_use]
    pub fn decode(payload: &Value) -> Option<Self> {
        if payload.get(PROTOCOL_FIELD).and_then(Value::as_str) != Some(PROTOCOL_MARKER) {
            return None;
        }

        match Self::deserialize(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, "Dropping malformed proxy message");
                None
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
