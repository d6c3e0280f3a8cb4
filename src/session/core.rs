//! Caller-facing session.
//!
//! A [`Session`] wraps one client (direct or proxied) and gives the
//! application a stable surface across everything that happens underneath:
//!
//! - requests issued before the client is connected, or while it is
//!   disconnected, are queued and flushed in order once it is back
//! - a proxied client whose host never answers is replaced by a direct one
//! - connection state changes are announced as [`SessionEvent`]s
//!
//! # Example
//!
//! ```no_run
//! use pubsub_client::{Listener, Session, SessionEvent};
//!
//! # async fn example() -> pubsub_client::Result<()> {
//! let session = Session::builder().build()?;
//! session.on_event(|event: &SessionEvent| println!("{event:?}"));
//!
//! let listener = Listener::new(|payload| println!("{payload}"));
//! session.subscribe("video-playback.1234", "token", &listener).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::client::{ClientCommand, ClientHandle, ClientKind};
use crate::correlation::Listener;
use crate::error::Result;
use crate::events::{ClientEvent, EventDispatcher, HandlerId, SessionEvent};
use crate::proxy::{ContextHandle, ProxyHostHandle};
use crate::reconnect::spawn_direct;

use super::builder::SessionBuilder;
use super::options::SessionConfig;
use super::registry::Environment;

// ============================================================================
// Types
// ============================================================================

/// Connection status shared between the handle and the actor.
#[derive(Debug, Clone, Copy)]
struct SessionStatus {
    ready: bool,
    mode: ClientKind,
    disconnects: u64,
}

/// Internal shared state for the session.
struct SessionInner {
    environment: Environment,
    address: Url,
    commands: mpsc::UnboundedSender<ClientCommand>,
    events: Arc<EventDispatcher<SessionEvent>>,
    status: Arc<Mutex<SessionStatus>>,
    host: Option<ProxyHostHandle>,
}

// ============================================================================
// Session
// ============================================================================

/// Resilient subscription session.
///
/// Clones share the same actor. The session stops when
/// [`shutdown`](Self::shutdown) is called or every clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.lock();
        f.debug_struct("Session")
            .field("environment", &self.inner.environment)
            .field("address", &self.inner.address.as_str())
            .field("mode", &status.mode)
            .field("ready", &status.ready)
            .field("disconnects", &status.disconnects)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session - Public API
// ============================================================================

impl Session {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Subscribes `listener` to `topic`.
    ///
    /// Waits for the session to be connected if it is not.
    ///
    /// # Errors
    ///
    /// - [`Error::ServerRejected`](crate::Error::ServerRejected) if the edge
    ///   refuses the topic
    /// - [`Error::ResponseTimeout`](crate::Error::ResponseTimeout) if the edge
    ///   does not answer in time
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the
    ///   session stops first
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

    /// Subscribes `listener` to `topic`, reporting through `completion`.
    pub fn subscribe_with(
        &self,
        topic: &str,
        credential: &str,
        listener: &Listener,
        completion: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.send(ClientCommand::Subscribe {
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
        self.send(ClientCommand::Unsubscribe {
            topic: topic.to_string(),
            listener: listener.clone(),
            completion: Box::new(completion),
        });
    }

    /// Delivers `payload` to the local listeners of `topic` as if it had
    /// arrived from the edge.
    pub fn simulate_message(&self, topic: &str, payload: Value) {
        self.send(ClientCommand::Inject {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Registers a handler for session events.
    pub fn on_event(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.events.on(handler)
    }

    /// Removes a handler registered with [`on_event`](Self::on_event).
    pub fn off_event(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// Stops the session.
    ///
    /// Transports are abandoned without raising events. Outstanding and
    /// queued requests fail with
    /// [`Error::ConnectionClosed`](crate::Error::ConnectionClosed).
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(ClientCommand::Shutdown);
    }
}

// ============================================================================
// Session - Accessors
// ============================================================================

impl Session {
    /// Returns `true` while requests go straight to the client.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.status.lock().ready
    }

    /// Returns how the session currently reaches the edge.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ClientKind {
        self.inner.status.lock().mode
    }

    /// Number of unexpected disconnects seen.
    #[inline]
    #[must_use]
    pub fn disconnect_count(&self) -> u64 {
        self.inner.status.lock().disconnects
    }

    /// Edge environment.
    #[inline]
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    /// Edge address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &Url {
        &self.inner.address
    }

    /// Address other sessions proxy through, if this session serves.
    #[inline]
    #[must_use]
    pub fn host(&self) -> Option<&ContextHandle> {
        self.inner.host.as_ref().map(ProxyHostHandle::context)
    }

    /// Returns `true` while the session is running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    /// Returns `true` if both handles refer to the same session.
    #[inline]
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Session - Internal
// ============================================================================

impl Session {
    /// Spawns the actor around `client`.
    pub(crate) fn start(
        environment: Environment,
        address: Url,
        config: SessionConfig,
        client: ClientHandle,
        host: Option<ProxyHostHandle>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventDispatcher::new());
        let status = Arc::new(Mutex::new(SessionStatus {
            ready: false,
            mode: client.kind(),
            disconnects: 0,
        }));

        let mut actor = SessionActor {
            address: address.clone(),
            config,
            client,
            generation: 0,
            handler: None,
            client_tx,
            events: Arc::clone(&events),
            status: Arc::clone(&status),
            queue: VecDeque::new(),
            has_disconnected: false,
            host: host.clone(),
        };
        actor.attach();
        tokio::spawn(actor.run(commands_rx, client_rx));

        info!(%environment, %address, "Session started");
        Self {
            inner: Arc::new(SessionInner {
                environment,
                address,
                commands: commands_tx,
                events,
                status,
                host,
            }),
        }
    }

    fn send(&self, command: ClientCommand) {
        if let Err(mpsc::error::SendError(command)) = self.inner.commands.send(command) {
            command.reject();
        }
    }
}

// ============================================================================
// SessionActor
// ============================================================================

/// Event from the client of a given generation.
type ClientInput = (u64, ClientEvent);

struct SessionActor {
    address: Url,
    config: SessionConfig,
    client: ClientHandle,
    /// Bumped on every client replacement; stale events are ignored.
    generation: u64,
    handler: Option<HandlerId>,
    client_tx: mpsc::UnboundedSender<ClientInput>,
    events: Arc<EventDispatcher<SessionEvent>>,
    status: Arc<Mutex<SessionStatus>>,
    queue: VecDeque<ClientCommand>,
    has_disconnected: bool,
    host: Option<ProxyHostHandle>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        mut client_events: mpsc::UnboundedReceiver<ClientInput>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(ClientCommand::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }

                Some((generation, event)) = client_events.recv() => {
                    if generation == self.generation {
                        self.on_client_event(event);
                    } else {
                        trace!(generation, ?event, "Ignoring event from replaced client");
                    }
                }
            }
        }

        self.stop();
        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject();
        }
        info!(address = %self.address, "Session stopped");
    }

    /// Listens to the current client and starts its trust handshake.
    fn attach(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.client_tx.clone();
        self.handler = Some(self.client.events().on(move |event: &ClientEvent| {
            let _ = tx.send((generation, event.clone()));
        }));

        debug!(generation, kind = ?self.client.kind(), "Verifying client");
        self.client.verify();
    }

    fn detach(&mut self) {
        if let Some(handler) = self.handler.take() {
            self.client.events().off(handler);
        }
        self.client.shutdown();
    }

    fn stop(&mut self) {
        self.status.lock().ready = false;
        for command in self.queue.drain(..) {
            command.reject();
        }
        if let Some(host) = &self.host {
            host.shutdown();
        }
        self.detach();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Subscribe { .. } | ClientCommand::Unsubscribe { .. } => {
                if self.status.lock().ready {
                    self.client.dispatch(command);
                } else {
                    trace!(?command, queued = self.queue.len() + 1, "Queueing until connected");
                    self.queue.push_back(command);
                }
            }
            ClientCommand::Inject { .. } => self.client.dispatch(command),
            ClientCommand::Verify | ClientCommand::Connect | ClientCommand::Shutdown => {}
        }
    }

    fn flush(&mut self) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "Flushing queued requests");
        }
        while let Some(command) = self.queue.pop_front() {
            self.client.dispatch(command);
        }
    }

    // ========================================================================
    // Client Events
    // ========================================================================

    fn on_client_event(&mut self, event: ClientEvent) {
        trace!(?event, "Client event");
        match event {
            ClientEvent::Verified => self.client.connect(),

            ClientEvent::Unverified => self.fall_back_to_direct(),

            ClientEvent::Connected => {
                self.status.lock().ready = true;
                self.events.emit(&SessionEvent::Connected);
                if self.has_disconnected {
                    self.events.emit(&SessionEvent::Reconnected);
                }
                self.flush();
            }

            ClientEvent::Disconnected => {
                self.has_disconnected = true;
                {
                    let mut status = self.status.lock();
                    status.ready = false;
                    status.disconnects += 1;
                }
                self.events.emit(&SessionEvent::Disconnected);
            }

            ClientEvent::SubscriptionDropped { topic } => {
                self.events.emit(&SessionEvent::SubscriptionDropped { topic });
            }
        }
    }

    fn fall_back_to_direct(&mut self) {
        if self.client.kind() != ClientKind::Proxied {
            return;
        }
        warn!(address = %self.address, "Proxy host unverified, connecting directly");

        self.detach();
        self.client = spawn_direct(
            self.address.clone(),
            self.config.transport_config(),
            self.config.coordinator_config(),
        );
        self.status.lock().mode = ClientKind::Direct;
        self.attach();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::error::Error;
    use crate::proxy::Context;
    use crate::testing::{MockEdge, init_tracing, unreachable_url};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> SessionConfig {
        SessionConfig::new()
            .with_heartbeat_interval(Duration::from_millis(200))
            .with_pong_timeout(Duration::from_millis(100))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
            .with_response_timeout(Duration::from_secs(2))
            .with_reconnect_jitter(Duration::from_millis(20))
            .with_verify_timeout(Duration::from_millis(200))
            .with_orphan_sweep_interval(Duration::from_millis(100))
    }

    fn direct(edge: &MockEdge) -> Session {
        Session::builder()
            .address(edge.url().as_str())
            .config(fast_config())
            .build()
            .expect("build")
    }

    fn record_events(session: &Session) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.on_event(move |event: &SessionEvent| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    async fn expect_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, expected: SessionEvent) {
        let event = timeout(WAIT, rx.recv()).await.expect("event in time").expect("open");
        assert_eq!(event, expected);
    }

    fn collecting_listener() -> (Listener, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::new(move |payload| {
            let _ = tx.send(payload.clone());
        });
        (listener, rx)
    }

    async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        timeout(WAIT, rx.recv()).await.expect("payload in time").expect("open")
    }

    fn message(topic: &str, body: &str) -> Value {
        json!({ "type": "MESSAGE", "data": { "topic": topic, "message": body } })
    }

    #[tokio::test]
    async fn test_requests_before_connect_are_flushed() {
        init_tracing();
        let mut edge = MockEdge::start().await;
        let session = direct(&edge);
        let (listener, mut payloads) = collecting_listener();

        // Issued right away, before the client reports Connected.
        session.subscribe("chat.1", "cred", &listener).await.expect("subscribed");
        assert!(session.is_connected());
        assert_eq!(session.mode(), ClientKind::Direct);

        let (_, frame) = edge.next_frame_of("LISTEN").await;
        assert_eq!(frame["data"]["topics"], json!(["chat.1"]));

        edge.broadcast(message("chat.1", "hello"));
        assert_eq!(next_payload(&mut payloads).await, json!("hello"));

        session.shutdown();
    }

    #[tokio::test]
    async fn test_reconnected_after_disconnect() {
        init_tracing();
        let mut edge = MockEdge::start().await;
        let session = direct(&edge);
        let mut events = record_events(&session);
        expect_event(&mut events, SessionEvent::Connected).await;

        session.subscribe("chat.1", "cred", &Listener::new(|_| {})).await.expect("subscribed");
        edge.next_frame_of("LISTEN").await;

        edge.set_auto_pong(false);
        expect_event(&mut events, SessionEvent::Disconnected).await;
        assert!(!session.is_connected());
        assert_eq!(session.disconnect_count(), 1);

        // Queued while disconnected.
        let (tx, rx) = oneshot::channel();
        session.subscribe_with("chat.2", "cred", &Listener::new(|_| {}), move |result| {
            let _ = tx.send(result);
        });

        edge.set_auto_pong(true);
        expect_event(&mut events, SessionEvent::Connected).await;
        expect_event(&mut events, SessionEvent::Reconnected).await;

        let result = timeout(WAIT, rx).await.expect("resolved in time").expect("completion");
        assert!(result.is_ok());

        let topics: Vec<Value> = edge
            .frames_of_until_quiet("LISTEN", Duration::from_millis(200))
            .await
            .into_iter()
            .map(|(_, frame)| frame["data"]["topics"][0].clone())
            .collect();
        assert!(topics.contains(&json!("chat.1")), "replayed: {topics:?}");
        assert!(topics.contains(&json!("chat.2")), "flushed: {topics:?}");

        session.shutdown();
    }

    #[tokio::test]
    async fn test_simulate_message_reaches_local_listeners() -> anyhow::Result<()> {
        let edge = MockEdge::start().await;
        let session = direct(&edge);
        let (listener, mut payloads) = collecting_listener();

        session.subscribe("chat.1", "cred", &listener).await?;
        session.simulate_message("chat.1", json!({ "injected": true }));
        assert_eq!(next_payload(&mut payloads).await, json!({ "injected": true }));

        // Unsubscribed listeners no longer see injected messages.
        session.unsubscribe("chat.1", &listener).await?;
        session.simulate_message("chat.1", json!({ "injected": false }));
        let late = timeout(Duration::from_millis(100), payloads.recv()).await;
        assert!(late.is_err(), "no delivery after unsubscribe");

        session.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_requests() {
        let session = Session::builder()
            .address(unreachable_url().as_str())
            .config(fast_config())
            .build()
            .expect("build");

        let pending = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .subscribe("chat.1", "cred", &Listener::new(|_| {}))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.shutdown();

        let result = timeout(WAIT, pending).await.expect("resolved").expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));

        timeout(WAIT, async {
            while session.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stopped");
        let result = session.unsubscribe("chat.1", &Listener::new(|_| {})).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_silent_host_falls_back_to_direct() {
        init_tracing();
        let mut edge = MockEdge::start().await;
        // Nobody serves this mailbox.
        let silent = Context::new("https://www.twitch.tv/");

        let session = Session::builder()
            .address(edge.url().as_str())
            .config(fast_config())
            .proxy_via(silent.handle(), Context::new("https://player.twitch.tv/"))
            .build()
            .expect("build");
        assert_eq!(session.mode(), ClientKind::Proxied);
        let mut events = record_events(&session);

        let (listener, mut payloads) = collecting_listener();
        session.subscribe("chat.1", "cred", &listener).await.expect("subscribed");
        assert_eq!(session.mode(), ClientKind::Direct);
        expect_event(&mut events, SessionEvent::Connected).await;

        edge.next_frame_of("LISTEN").await;
        edge.broadcast(message("chat.1", "direct"));
        assert_eq!(next_payload(&mut payloads).await, json!("direct"));

        session.shutdown();
    }

    #[tokio::test]
    async fn test_proxied_sessions_share_one_connection() {
        init_tracing();
        let mut edge = MockEdge::start().await;

        let owner = Session::builder()
            .address(edge.url().as_str())
            .config(fast_config())
            .serve(Context::new("https://www.twitch.tv/"))
            .build()
            .expect("build owner");
        let host = owner.host().cloned().expect("serving");

        let first = Session::builder()
            .config(fast_config())
            .proxy_via(host.clone(), Context::new("https://player.twitch.tv/"))
            .build()
            .expect("build first");
        let second = Session::builder()
            .config(fast_config())
            .proxy_via(host, Context::new("https://clips.twitch.tv/"))
            .build()
            .expect("build second");

        let (a, mut a_payloads) = collecting_listener();
        let (b, mut b_payloads) = collecting_listener();
        let (c, mut c_payloads) = collecting_listener();
        first.subscribe("chat.1", "cred", &a).await.expect("a subscribed");
        first.subscribe("chat.1", "cred", &b).await.expect("b subscribed");
        second.subscribe("chat.1", "cred", &c).await.expect("c subscribed");
        assert_eq!(first.mode(), ClientKind::Proxied);
        assert_eq!(second.mode(), ClientKind::Proxied);

        // One upstream subscription per context, all on one connection.
        let listens = edge
            .frames_of_until_quiet("LISTEN", Duration::from_millis(200))
            .await;
        assert_eq!(listens.len(), 2);
        assert!(listens.iter().all(|(index, _)| *index == 0));
        assert_eq!(edge.connection_count(), 1);

        edge.broadcast(message("chat.1", "shared"));
        assert_eq!(next_payload(&mut a_payloads).await, json!("shared"));
        assert_eq!(next_payload(&mut b_payloads).await, json!("shared"));
        assert_eq!(next_payload(&mut c_payloads).await, json!("shared"));

        first.unsubscribe("chat.1", &a).await.expect("a unsubscribed");
        first.unsubscribe("chat.1", &b).await.expect("b unsubscribed");
        let unlistens = edge
            .frames_of_until_quiet("UNLISTEN", Duration::from_millis(200))
            .await;
        assert!(unlistens.is_empty(), "second context still listening");

        second.unsubscribe("chat.1", &c).await.expect("c unsubscribed");
        let (_, frame) = edge.next_frame_of("UNLISTEN").await;
        assert_eq!(frame["data"]["topics"], json!(["chat.1"]));

        first.shutdown();
        second.shutdown();
        owner.shutdown();
    }
}
