//! Proxy host: serves consumers from one upstream client.
//!
//! The host listens on its context mailbox, answers the trust handshake for
//! trusted origins, and maps each consumer subscription onto the upstream
//! client:
//!
//! | Consumer sends | Host does |
//! |----------------|-----------|
//! | `connect` | remembers the consumer, connects upstream |
//! | `verify` | echoes `verify` if the consumer's origin is trusted |
//! | `LISTEN` | subscribes upstream once per (consumer, topic) |
//! | `UNLISTEN` | unsubscribes upstream, or fails for an unknown pair |
//!
//! Entries of consumers whose mailbox is gone are swept periodically.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use crate::client::ClientHandle;
use crate::correlation::Listener;
use crate::error::Result;
use crate::events::{ClientEvent, HandlerId};
use crate::identifiers::{ContextId, ListenerId, Nonce};
use crate::protocol::{ProxyMessage, RequestData, RequestKind};

use super::channel::{Context, ContextHandle, Delivery};
use super::trust::OriginPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Interval between sweeps for entries of dead consumers.
pub const DEFAULT_ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Error reported for an unsubscribe the host has no entry for.
pub const UNKNOWN_SUBSCRIPTION: &str = "unknown subscription";

// ============================================================================
// Types
// ============================================================================

type EntryKey = (ContextId, String);

/// Forwarding entry of one consumer on one topic.
struct Entry {
    source: ContextHandle,
    listener: Listener,
}

/// Inputs produced outside the mailbox.
enum HostInput {
    Upstream(ClientEvent),
    Resolved {
        source: ContextHandle,
        nonce: Nonce,
        kind: RequestKind,
        topic: String,
        listener: ListenerId,
        result: Result<()>,
    },
    Shutdown,
}

/// Completion that routes an upstream outcome back into the host loop.
fn resolver(
    inputs: mpsc::UnboundedSender<HostInput>,
    source: ContextHandle,
    nonce: Nonce,
    kind: RequestKind,
    topic: String,
    listener: ListenerId,
) -> impl FnOnce(Result<()>) + Send + 'static {
    move |result| {
        let _ = inputs.send(HostInput::Resolved {
            source,
            nonce,
            kind,
            topic,
            listener,
            result,
        });
    }
}

// ============================================================================
// ProxyHostHandle
// ============================================================================

/// Handle to a running proxy host.
///
/// Dropping the handle leaves the host running; call
/// [`shutdown`](Self::shutdown) to stop it.
#[derive(Debug, Clone)]
pub struct ProxyHostHandle {
    context: ContextHandle,
    inputs: mpsc::UnboundedSender<HostInput>,
}

impl std::fmt::Debug for HostInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream(event) => f.debug_tuple("Upstream").field(event).finish(),
            Self::Resolved { nonce, kind, .. } => f
                .debug_struct("Resolved")
                .field("nonce", nonce)
                .field("kind", kind)
                .finish_non_exhaustive(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ProxyHostHandle {
    /// Address consumers should talk to.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Returns `true` while the host is running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }

    /// Stops the host. Upstream subscriptions are left to the client.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(HostInput::Shutdown);
    }
}

// ============================================================================
// ProxyHost
// ============================================================================

/// State of a running host.
pub struct ProxyHost {
    context: Context,
    me: ContextHandle,
    client: ClientHandle,
    policy: OriginPolicy,
    consumers: Vec<ContextHandle>,
    entries: FxHashMap<EntryKey, Entry>,
    upstream_connected: bool,
    inputs: mpsc::UnboundedSender<HostInput>,
}

impl ProxyHost {
    /// Spawns a host serving `context` from `client`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn(
        context: Context,
        client: ClientHandle,
        policy: OriginPolicy,
        sweep_interval: Duration,
    ) -> ProxyHostHandle {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let me = context.handle();

        let upstream_inputs = inputs_tx.clone();
        let handler = client.events().on(move |event: &ClientEvent| {
            let _ = upstream_inputs.send(HostInput::Upstream(event.clone()));
        });

        let host = Self {
            context,
            me: me.clone(),
            client,
            policy,
            consumers: Vec::new(),
            entries: FxHashMap::default(),
            upstream_connected: false,
            inputs: inputs_tx.clone(),
        };

        info!(context = %me.id(), origin = me.origin(), "Proxy host started");
        tokio::spawn(host.run(inputs_rx, handler, sweep_interval));

        ProxyHostHandle {
            context: me,
            inputs: inputs_tx,
        }
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<HostInput>,
        handler: HandlerId,
        sweep_interval: Duration,
    ) {
        let mut sweep = interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                delivery = self.context.recv() => {
                    // The host holds a handle to its own mailbox, so it never closes.
                    if let Some(delivery) = delivery {
                        self.on_delivery(delivery);
                    }
                }

                input = inputs.recv() => {
                    match input {
                        Some(HostInput::Upstream(event)) => self.on_upstream(event),
                        Some(HostInput::Resolved { source, nonce, kind, topic, listener, result }) => {
                            self.on_resolved(&source, nonce, kind, &topic, listener, result);
                        }
                        Some(HostInput::Shutdown) | None => break,
                    }
                }

                _ = sweep.tick() => self.sweep_orphans(),
            }
        }

        self.client.events().off(handler);
        inputs.close();
        info!(context = %self.me.id(), "Proxy host stopped");
    }

    // ========================================================================
    // Consumer Messages
    // ========================================================================

    fn on_delivery(&mut self, delivery: Delivery) {
        let Delivery { source, payload } = delivery;
        let Some(message) = ProxyMessage::decode(&payload) else {
            return;
        };
        trace!(source = %source.id(), ?message, "Host received");

        match message {
            ProxyMessage::Connect => self.on_connect(source),

            ProxyMessage::Verify => {
                if self.policy.allows(source.origin()) {
                    source.post_message(&self.me, &ProxyMessage::Verify);
                } else {
                    warn!(origin = source.origin(), "Verify from untrusted origin ignored");
                }
            }

            ProxyMessage::Listen { nonce, data } => {
                if source.is_alive() {
                    self.on_listen(source, nonce, &data);
                }
            }

            ProxyMessage::Unlisten { nonce, data } => {
                if source.is_alive() {
                    self.on_unlisten(&source, nonce, &data);
                }
            }

            ProxyMessage::Connected
            | ProxyMessage::Disconnected
            | ProxyMessage::Success { .. }
            | ProxyMessage::Failure { .. }
            | ProxyMessage::Message { .. } => {
                trace!("Ignoring host-bound copy of a consumer message");
            }
        }
    }

    fn on_connect(&mut self, source: ContextHandle) {
        if !self.consumers.contains(&source) {
            debug!(consumer = %source.id(), "Consumer connected");
            self.consumers.push(source.clone());
        }
        self.client.connect();
        if self.upstream_connected {
            source.post_message(&self.me, &ProxyMessage::Connected);
        }
    }

    fn on_listen(&mut self, source: ContextHandle, nonce: Nonce, data: &RequestData) {
        let topic = data.topic().to_string();
        let key = (source.id(), topic.clone());

        if self.entries.contains_key(&key) {
            debug!(consumer = %source.id(), topic, "Already forwarding, acknowledging");
            source.post_message(&self.me, &ProxyMessage::Success { nonce });
            return;
        }

        let listener = {
            let target = source.clone();
            let me = self.me.clone();
            let topic = topic.clone();
            Listener::new(move |payload| {
                target.post_message(
                    &me,
                    &ProxyMessage::Message {
                        topic: topic.clone(),
                        message: payload.clone(),
                    },
                );
            })
        };

        debug!(consumer = %source.id(), topic, "Forwarding subscription upstream");
        let credential = data.auth_token.clone().unwrap_or_default();
        let completion = resolver(
            self.inputs.clone(),
            source.clone(),
            nonce,
            RequestKind::Subscribe,
            topic.clone(),
            listener.id(),
        );
        self.client
            .subscribe_with(&topic, &credential, &listener, completion);

        self.entries.insert(key, Entry { source, listener });
    }

    fn on_unlisten(&mut self, source: &ContextHandle, nonce: Nonce, data: &RequestData) {
        let topic = data.topic().to_string();
        let Some(entry) = self.entries.remove(&(source.id(), topic.clone())) else {
            debug!(consumer = %source.id(), topic, "Unsubscribe for unknown entry");
            source.post_message(
                &self.me,
                &ProxyMessage::Failure {
                    nonce,
                    error: UNKNOWN_SUBSCRIPTION.to_string(),
                },
            );
            return;
        };

        let completion = resolver(
            self.inputs.clone(),
            source.clone(),
            nonce,
            RequestKind::Unsubscribe,
            topic.clone(),
            entry.listener.id(),
        );
        self.client
            .unsubscribe_with(&topic, &entry.listener, completion);
    }

    fn on_resolved(
        &mut self,
        source: &ContextHandle,
        nonce: Nonce,
        kind: RequestKind,
        topic: &str,
        listener: ListenerId,
        result: Result<()>,
    ) {
        match result {
            Ok(()) => {
                source.post_message(&self.me, &ProxyMessage::Success { nonce });
            }
            Err(e) => {
                warn!(consumer = %source.id(), topic, ?kind, error = %e, "Upstream request failed");
                if kind == RequestKind::Subscribe {
                    let key = (source.id(), topic.to_string());
                    if self
                        .entries
                        .get(&key)
                        .is_some_and(|entry| entry.listener.id() == listener)
                    {
                        self.entries.remove(&key);
                    }
                }
                source.post_message(
                    &self.me,
                    &ProxyMessage::Failure {
                        nonce,
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    // ========================================================================
    // Upstream Events
    // ========================================================================

    fn on_upstream(&mut self, event: ClientEvent) {
        let message = match event {
            ClientEvent::Connected => {
                self.upstream_connected = true;
                ProxyMessage::Connected
            }
            ClientEvent::Disconnected => {
                self.upstream_connected = false;
                ProxyMessage::Disconnected
            }
            ClientEvent::SubscriptionDropped { topic } => {
                warn!(topic, "Upstream dropped a forwarded subscription");
                return;
            }
            ClientEvent::Verified | ClientEvent::Unverified => return,
        };

        self.consumers.retain(ContextHandle::is_alive);
        debug!(consumers = self.consumers.len(), ?message, "Relaying upstream state");
        for consumer in &self.consumers {
            consumer.post_message(&self.me, &message);
        }
    }

    // ========================================================================
    // Orphan Sweep
    // ========================================================================

    fn sweep_orphans(&mut self) {
        let orphaned: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.source.is_alive())
            .map(|(key, _)| key.clone())
            .collect();

        for key in orphaned {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            let topic = key.1;
            debug!(consumer = %key.0, topic, "Cleaning up orphaned entry");

            let logged_topic = topic.clone();
            self.client
                .unsubscribe_with(&topic, &entry.listener, move |result| match result {
                    Ok(()) => debug!(topic = logged_topic, "Orphaned entry unsubscribed"),
                    Err(e) => debug!(topic = logged_topic, error = %e, "Orphaned entry cleanup failed"),
                });
        }

        self.consumers.retain(ContextHandle::is_alive);
    }
}

// ============================================================================
// Tests
// ============================================================================
