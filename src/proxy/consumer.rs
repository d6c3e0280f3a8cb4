//! Proxy consumer: a client that reaches the edge through a host.
//!
//! The consumer speaks the proxy protocol to a single host context. Its
//! requests carry the same token, timeout and completion contract as a
//! direct client because both run a [`Correlator`].
//!
//! Until the host echoes `verify` the consumer is unverified. If no echo
//! arrives within the verify timeout, the consumer emits
//! [`ClientEvent::Unverified`] and drops its mailbox for good.

// ============================================================================
// Imports
// ============================================================================

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::{ClientCommand, ClientHandle, ClientKind};
use crate::clock::{earliest, now, sleep_until_deadline};
use crate::correlation::{Correlator, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventDispatcher};
use crate::protocol::{ProxyMessage, Request};
use crate::transport::RequestSink;

use super::channel::{Context, ContextHandle, Delivery};

// ============================================================================
// Constants
// ============================================================================

/// Time the host has to answer the trust handshake.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// ConsumerConfig
// ============================================================================

/// Timing knobs of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Deadline for each request.
    pub response_timeout: Duration,
    /// Deadline for the host's `verify` echo.
    pub verify_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }
}

// ============================================================================
// HostSink
// ============================================================================

/// Sends correlated requests to the host.
struct HostSink<'a> {
    host: &'a ContextHandle,
    me: &'a ContextHandle,
}

impl RequestSink for HostSink<'_> {
    fn send_request(&self, request: &Request) -> Result<()> {
        if self
            .host
            .post_message(self.me, &ProxyMessage::from_request(request))
        {
            Ok(())
        } else {
            Err(Error::connection_failure(format!(
                "proxy host {} is gone",
                self.host.id()
            )))
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Spawns a consumer of the host at `host`, receiving on `context`.
///
/// Must be called within a Tokio runtime.
pub fn spawn_consumer(context: Context, host: ContextHandle, config: ConsumerConfig) -> ClientHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let events = Arc::new(EventDispatcher::new());

    debug!(context = %context.handle().id(), host = %host.id(), "Spawning proxy consumer");
    let consumer = Consumer {
        me: context.handle(),
        context: Some(context),
        host,
        correlator: Correlator::new(config.response_timeout),
        config,
        verify_deadline: None,
        events: Arc::clone(&events),
    };
    tokio::spawn(consumer.run(commands_rx));

    ClientHandle::new(ClientKind::Proxied, commands_tx, events)
}

struct Consumer {
    me: ContextHandle,
    /// `None` once unverified.
    context: Option<Context>,
    host: ContextHandle,
    correlator: Correlator,
    config: ConsumerConfig,
    verify_deadline: Option<Instant>,
    events: Arc<EventDispatcher<ClientEvent>>,
}

/// Receives from the mailbox, or waits forever without one.
async fn recv_from(context: &mut Option<Context>) -> Option<Delivery> {
    match context {
        Some(context) => context.recv().await,
        None => future::pending().await,
    }
}

impl Consumer {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
        loop {
            let deadline = earliest(self.verify_deadline, self.correlator.next_deadline());

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(ClientCommand::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }

                Some(delivery) = recv_from(&mut self.context) => {
                    self.on_delivery(delivery);
                }

                () = sleep_until_deadline(deadline) => self.on_deadline(now()),
            }
        }

        self.correlator.fail_all();
        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject();
        }
        debug!(context = %self.me.id(), "Proxy consumer stopped");
    }

    fn on_command(&mut self, command: ClientCommand) {
        trace!(?command, "Consumer command");
        let sink = HostSink {
            host: &self.host,
            me: &self.me,
        };

        match command {
            ClientCommand::Verify => {
                debug!(host = %self.host.id(), "Verifying host");
                self.host.post_message(&self.me, &ProxyMessage::Verify);
                self.verify_deadline = Some(now() + self.config.verify_timeout);
            }
            ClientCommand::Connect => {
                self.host.post_message(&self.me, &ProxyMessage::Connect);
            }
            ClientCommand::Subscribe {
                topic,
                credential,
                listener,
                completion,
            } => {
                self.correlator
                    .subscribe(&topic, &credential, listener, completion, Some(&sink), now());
            }
            ClientCommand::Unsubscribe {
                topic,
                listener,
                completion,
            } => {
                self.correlator
                    .unsubscribe(&topic, listener, completion, Some(&sink), now());
            }
            ClientCommand::Inject { topic, payload } => {
                self.correlator.dispatch_message(&topic, &payload);
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn on_delivery(&mut self, delivery: Delivery) {
        if delivery.source.id() != self.host.id() {
            trace!(source = %delivery.source.id(), "Ignoring message from non-host context");
            return;
        }
        let Some(message) = ProxyMessage::decode(&delivery.payload) else {
            return;
        };

        match message {
            ProxyMessage::Verify => {
                if self.verify_deadline.take().is_some() {
                    debug!(host = %self.host.id(), "Host verified");
                    self.events.emit(&ClientEvent::Verified);
                }
            }
            ProxyMessage::Connected => self.events.emit(&ClientEvent::Connected),
            ProxyMessage::Disconnected => self.events.emit(&ClientEvent::Disconnected),
            ProxyMessage::Success { nonce } => {
                self.correlator.on_response(&nonce, Ok(()));
            }
            ProxyMessage::Failure { nonce, error } => {
                self.correlator.on_response(&nonce, Err(error));
            }
            ProxyMessage::Message { topic, message } => {
                self.correlator.dispatch_message(&topic, &message);
            }
            ProxyMessage::Connect | ProxyMessage::Listen { .. } | ProxyMessage::Unlisten { .. } => {
                trace!("Ignoring consumer-bound copy of a host message");
            }
        }
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.verify_deadline.is_some_and(|deadline| deadline <= now) {
            warn!(host = %self.host.id(), "Host did not verify in time");
            self.verify_deadline = None;
            self.context = None;
            self.events.emit(&ClientEvent::Unverified);
        }
        self.correlator.expire(now);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::correlation::Listener;
    use crate::protocol::RequestData;

    const WAIT: Duration = Duration::from_secs(2);

    struct Rig {
        client: ClientHandle,
        host: Context,
        consumer: ContextHandle,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    fn start(config: ConsumerConfig) -> Rig {
        let host = Context::new("https://www.twitch.tv/");
        let context = Context::new("https://player.twitch.tv/");
        let consumer = context.handle();
        let client = spawn_consumer(context, host.handle(), config);

        let (tx, events) = mpsc::unbounded_channel();
        client.events().on(move |event: &ClientEvent| {
            let _ = tx.send(event.clone());
        });

        Rig {
            client,
            host,
            consumer,
            events,
        }
    }

    impl Rig {
        async fn host_receives(&mut self) -> ProxyMessage {
            let delivery = timeout(WAIT, self.host.recv())
                .await
                .expect("message in time")
                .expect("mailbox open");
            assert_eq!(delivery.source, self.consumer);
            ProxyMessage::decode(&delivery.payload).expect("proxy message")
        }

        fn host_sends(&self, message: &ProxyMessage) {
            self.consumer.post_message(&self.host.handle(), message);
        }

        async fn event(&mut self) -> ClientEvent {
            timeout(WAIT, self.events.recv())
                .await
                .expect("event in time")
                .expect("dispatcher alive")
        }
    }

    #[tokio::test]
    async fn test_verify_handshake() {
        let mut rig = start(ConsumerConfig::default());
        rig.client.verify();

        assert_eq!(rig.host_receives().await, ProxyMessage::Verify);
        rig.host_sends(&ProxyMessage::Verify);
        assert_eq!(rig.event().await, ClientEvent::Verified);
    }

    #[tokio::test]
    async fn test_unverified_stops_listening() {
        let config = ConsumerConfig {
            verify_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut rig = start(config);
        rig.client.verify();
        assert_eq!(rig.host_receives().await, ProxyMessage::Verify);

        assert_eq!(rig.event().await, ClientEvent::Unverified);

        timeout(WAIT, async {
            while rig.consumer.is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mailbox dropped");
        assert!(!rig.consumer.post_message(&rig.host.handle(), &ProxyMessage::Verify));
    }

    #[tokio::test]
    async fn test_subscribe_roundtrip_and_messages() {
        let mut rig = start(ConsumerConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let received = Arc::clone(&received);
            Listener::new(move |payload| received.lock().push(payload.clone()))
        };

        let pending = tokio::spawn({
            let client = rig.client.clone();
            let listener = listener.clone();
            async move { client.subscribe("chat.1", "cred", &listener).await }
        });

        let ProxyMessage::Listen { nonce, data } = rig.host_receives().await else {
            panic!("expected LISTEN");
        };
        assert_eq!(
            data,
            RequestData {
                topics: vec!["chat.1".to_string()],
                auth_token: Some("cred".to_string())
            }
        );
        rig.host_sends(&ProxyMessage::Success { nonce });
        pending.await.expect("join").expect("subscribed");

        rig.host_sends(&ProxyMessage::Message {
            topic: "chat.1".to_string(),
            message: json!("hi"),
        });
        timeout(WAIT, async {
            while received.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delivered");
        assert_eq!(*received.lock(), vec![json!("hi")]);
    }

    #[tokio::test]
    async fn test_failure_rejects() {
        let mut rig = start(ConsumerConfig::default());
        let pending = tokio::spawn({
            let client = rig.client.clone();
            async move { client.subscribe("chat.1", "bad", &Listener::new(|_| {})).await }
        });

        let ProxyMessage::Listen { nonce, .. } = rig.host_receives().await else {
            panic!("expected LISTEN");
        };
        rig.host_sends(&ProxyMessage::Failure {
            nonce,
            error: "ERR_BADAUTH".to_string(),
        });

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(Error::ServerRejected { message }) if message == "ERR_BADAUTH"));
    }

    #[tokio::test]
    async fn test_ignores_other_sources() {
        let mut rig = start(ConsumerConfig::default());
        rig.client.connect();
        assert_eq!(rig.host_receives().await, ProxyMessage::Connect);

        let impostor = Context::new("https://www.twitch.tv/");
        rig.consumer
            .post_message(&impostor.handle(), &ProxyMessage::Connected);
        rig.host_sends(&ProxyMessage::Disconnected);

        assert_eq!(rig.event().await, ClientEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_request_to_vanished_host_fails() {
        let Rig { client, host, .. } = start(ConsumerConfig::default());
        drop(host);

        let result = client.subscribe("chat.1", "cred", &Listener::new(|_| {})).await;
        assert!(matches!(result, Err(Error::ConnectionFailure { message }) if message.contains("is gone")));
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let config = ConsumerConfig {
            response_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let rig = start(config);

        let result = rig
            .client
            .unsubscribe("chat.1", &Listener::new(|_| {}))
            .await;
        assert!(result.is_err_and(|e| e.is_timeout()));
    }
}
