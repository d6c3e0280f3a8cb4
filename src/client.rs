//! Handle to a running client actor.
//!
//! A client is either *direct* (owns its transports) or *proxied* (talks to
//! a proxy host in another context). Both run as a tokio task and accept the
//! same [`ClientCommand`]s, so a [`Session`](crate::Session) treats them
//! alike.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::correlation::{Completion, Listener};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventDispatcher};

// ============================================================================
// ClientCommand
// ============================================================================

/// Work for a client actor.
pub enum ClientCommand {
    /// Establish trust. Direct clients answer `Verified` at once.
    Verify,
    /// Connect, or ask the host to serve this client.
    Connect,
    /// Subscribe a listener.
    Subscribe {
        /// Topic.
        topic: String,
        /// Opaque credential.
        credential: String,
        /// Listener to register.
        listener: Listener,
        /// Called with the outcome.
        completion: Completion,
    },
    /// Unsubscribe a listener.
    Unsubscribe {
        /// Topic.
        topic: String,
        /// Listener to remove.
        listener: Listener,
        /// Called with the outcome.
        completion: Completion,
    },
    /// Deliver a payload locally as if it had arrived on `topic`.
    Inject {
        /// Topic.
        topic: String,
        /// Payload.
        payload: Value,
    },
    /// Fail outstanding requests and stop.
    Shutdown,
}

impl ClientCommand {
    /// Completes the command with `ConnectionClosed` without running it.
    pub fn reject(self) {
        match self {
            Self::Subscribe { completion, .. } | Self::Unsubscribe { completion, .. } => {
                completion(Err(Error::ConnectionClosed));
            }
            Self::Verify | Self::Connect | Self::Inject { .. } | Self::Shutdown => {}
        }
    }
}

impl fmt::Debug for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verify => f.write_str("Verify"),
            Self::Connect => f.write_str("Connect"),
            Self::Subscribe { topic, listener, .. } => f
                .debug_struct("Subscribe")
                .field("topic", topic)
                .field("listener", listener)
                .finish_non_exhaustive(),
            Self::Unsubscribe { topic, listener, .. } => f
                .debug_struct("Unsubscribe")
                .field("topic", topic)
                .field("listener", listener)
                .finish_non_exhaustive(),
            Self::Inject { topic, .. } => f
                .debug_struct("Inject")
                .field("topic", topic)
                .finish_non_exhaustive(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

// ============================================================================
// ClientHandle
// ============================================================================

/// How a client reaches the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Owns its transports.
    Direct,
    /// Goes through a proxy host.
    Proxied,
}

/// Cloneable handle to a client actor.
///
/// Commands sent after the actor stopped are rejected with
/// [`Error::ConnectionClosed`].
#[derive(Clone)]
pub struct ClientHandle {
    kind: ClientKind,
    commands: mpsc::UnboundedSender<ClientCommand>,
    events: Arc<EventDispatcher<ClientEvent>>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("kind", &self.kind)
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl ClientHandle {
    /// Wraps the command channel of a spawned actor.
    pub(crate) fn new(
        kind: ClientKind,
        commands: mpsc::UnboundedSender<ClientCommand>,
        events: Arc<EventDispatcher<ClientEvent>>,
    ) -> Self {
        Self {
            kind,
            commands,
            events,
        }
    }

    /// Returns how this client reaches the edge.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// Returns the client's event dispatcher.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &Arc<EventDispatcher<ClientEvent>> {
        &self.events
    }

    /// Returns `true` while the actor is running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Hands a command to the actor, rejecting it if the actor stopped.
    pub(crate) fn dispatch(&self, command: ClientCommand) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            command.reject();
        }
    }

    /// Starts the trust handshake.
    pub fn verify(&self) {
        self.dispatch(ClientCommand::Verify);
    }

    /// Connects the client.
    pub fn connect(&self) {
        self.dispatch(ClientCommand::Connect);
    }

    /// Subscribes `listener` to `topic`, reporting through `completion`.
    pub fn subscribe_with(
        &self,
        topic: &str,
        credential: &str,
        listener: &Listener,
        completion: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.dispatch(ClientCommand::Subscribe {
            topic: topic.to_string(),
            credential: credential.to_string(),
            listener: listener.clone(),
            completion: Box::new(completion),
        });
    }

    /// Unsubscribes `listener` from `topic`, reporting through `completion`.
    pub fn unsubscribe_with(
        &self,
        topic: &str,
        listener: &Listener,
        completion: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.dispatch(ClientCommand::Unsubscribe {
            topic: topic.to_string(),
            listener: listener.clone(),
            completion: Box::new(completion),
        });
    }

    /// Subscribes `listener` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection, a timeout, or `ConnectionClosed` if the
    /// client stops first.
    pub async fn subscribe(&self, topic: &str, credential: &str, listener: &Listener) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.subscribe_with(topic, credential, listener, move |result| {
            let _ = tx.send(result);
        });
        rx.await?
    }

    /// Unsubscribes `listener` from `topic`.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(&self, topic: &str, listener: &Listener) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.unsubscribe_with(topic, listener, move |result| {
            let _ = tx.send(result);
        });
        rx.await?
    }

    /// Delivers `payload` to the local listeners of `topic`.
    pub fn inject(&self, topic: &str, payload: Value) {
        self.dispatch(ClientCommand::Inject {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Stops the actor, failing outstanding requests.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
    }
}

// ============================================================================
// Tests
// ============================================================================
