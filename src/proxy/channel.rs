//! Cross-context mailboxes.
//!
//! A [`Context`] stands for an independent execution context (a page, a
//! frame, a worker) able to receive raw JSON payloads. Other contexts reach it
//! through a cloneable [`ContextHandle`]. Every delivery carries the sender's
//! handle so the receiver can check who is talking and reply.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::identifiers::ContextId;
use crate::protocol::ProxyMessage;

/// A payload received by a context.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sender.
    pub source: ContextHandle,
    /// Raw payload, not necessarily ours.
    pub payload: Value,
}

/// Address of a context.
///
/// The context is alive as long as its [`Context`] mailbox exists.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    origin: Arc<str>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContextHandle {}

impl ContextHandle {
    /// Context identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Origin the context was loaded from.
    #[inline]
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns `false` once the context's mailbox is gone.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Posts a raw payload from `source`. Returns `false` if the context is gone.
    pub fn post(&self, source: &ContextHandle, payload: Value) -> bool {
        self.tx
            .send(Delivery {
                source: source.clone(),
                payload,
            })
            .is_ok()
    }

    /// Posts a proxy protocol message from `source`.
    pub fn post_message(&self, source: &ContextHandle, message: &ProxyMessage) -> bool {
        match message.encode() {
            Ok(payload) => self.post(source, payload),
            Err(e) => {
                warn!(error = %e, "Failed to encode proxy message");
                false
            }
        }
    }
}

/// Mailbox of an execution context.
#[derive(Debug)]
pub struct Context {
    handle: ContextHandle,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Context {
    /// Creates a context loaded from `origin`.
    #[must_use]
    pub fn new(origin: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: ContextHandle {
                id: ContextId::generate(),
                origin: Arc::from(origin),
                tx,
            },
            rx,
        }
    }

    /// Returns this context's address.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}
