//! Primary/backup transport coordination.
//!
//! The coordinator owns the primary link, at most one backup link and the
//! [`Correlator`]. It is driven by [`TransportEvent`]s and an explicit clock,
//! and never performs I/O itself beyond calling into its links.
//!
//! # Reconnection Episode
//!
//! ```text
//! primary lost / RECONNECT
//!        │
//!        ▼
//! dial backup (after jitter) ──► backup open ──► replay N subscriptions
//!                                                     │
//!                         all N resolved (ok, error, timeout)
//!                                                     │
//!                                                     ▼
//!                   swap: backup becomes primary, queue flushed
//! ```
//!
//! Only an unexpected loss is visible to the owner: it sees `Disconnected`
//! when the primary fails and `Connected` at the swap. A server-requested
//! move is silent.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::clock::earliest;
use crate::correlation::{Completion, Correlator, DEFAULT_RESPONSE_TIMEOUT, Listener};
use crate::events::{ClientEvent, EventDispatcher};
use crate::identifiers::Nonce;
use crate::protocol::{InboundFrame, Request, RequestKind};
use crate::transport::backoff::jitter;
use crate::transport::{Dialer, Link, RequestSink, TransportEvent, TransportEventKind};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound of the random delay before a backup dials.
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_secs(2);

// ============================================================================
// CoordinatorConfig
// ============================================================================

/// Timing knobs of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Deadline for each request and each replay.
    pub response_timeout: Duration,
    /// Upper bound of the delay before a backup connects.
    pub reconnect_jitter: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Replay issued on the backup, waiting for its response.
#[derive(Debug)]
struct PendingReplay {
    /// Token of the request whose effect is being replayed.
    record: Nonce,
    deadline: Instant,
}

/// Owns the live connection and moves it to a new one when needed.
pub struct Coordinator<D: Dialer> {
    dialer: D,
    primary: D::Link,
    backup: Option<D::Link>,
    correlator: Correlator,
    pending_replays: FxHashMap<Nonce, PendingReplay>,
    config: CoordinatorConfig,
    events: Arc<EventDispatcher<ClientEvent>>,
    connect_called: bool,
    reconnecting: bool,
    notify_when_open: bool,
}

/// Sink offered to the correlator: the primary, unless a move is under way.
fn ready_sink<L: Link>(primary: &L, reconnecting: bool) -> Option<&dyn RequestSink> {
    if !reconnecting && primary.is_ready() {
        Some(primary)
    } else {
        None
    }
}

/// Maps a RESPONSE error string to an outcome.
fn outcome(error: &str) -> std::result::Result<(), String> {
    if error.is_empty() {
        Ok(())
    } else {
        Err(error.to_string())
    }
}

impl<D: Dialer> Coordinator<D> {
    /// Creates a coordinator with an idle primary.
    pub fn new(
        mut dialer: D,
        config: CoordinatorConfig,
        events: Arc<EventDispatcher<ClientEvent>>,
    ) -> Self {
        let primary = dialer.dial();
        Self {
            dialer,
            primary,
            backup: None,
            correlator: Correlator::new(config.response_timeout),
            pending_replays: FxHashMap::default(),
            config,
            events,
            connect_called: false,
            reconnecting: false,
            notify_when_open: false,
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Connects the primary. Later calls do nothing.
    pub fn connect(&mut self) {
        if self.connect_called {
            return;
        }
        self.connect_called = true;
        debug!(transport = %self.primary.id(), "Connecting primary");
        self.primary.connect(Duration::ZERO);
    }

    /// Subscribes `listener` to `topic`.
    pub fn subscribe(
        &mut self,
        topic: &str,
        credential: &str,
        listener: Listener,
        completion: Completion,
        now: Instant,
    ) {
        let sink = ready_sink(&self.primary, self.reconnecting);
        self.correlator
            .subscribe(topic, credential, listener, completion, sink, now);
    }

    /// Unsubscribes `listener` from `topic`.
    pub fn unsubscribe(
        &mut self,
        topic: &str,
        listener: Listener,
        completion: Completion,
        now: Instant,
    ) {
        let sink = ready_sink(&self.primary, self.reconnecting);
        self.correlator
            .unsubscribe(topic, listener, completion, sink, now);
    }

    /// Delivers `payload` to the listeners of `topic` as if it had arrived.
    pub fn inject(&self, topic: &str, payload: &Value) -> usize {
        self.correlator.dispatch_message(topic, payload)
    }

    /// Fails outstanding requests and abandons every link silently.
    pub fn shutdown(&mut self) {
        debug!("Coordinator shutting down");
        self.correlator.fail_all();
        self.pending_replays.clear();
        self.primary.abandon();
        if let Some(mut backup) = self.backup.take() {
            backup.abandon();
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Handles an event from any link. Events from retired links are ignored.
    pub fn handle(&mut self, event: TransportEvent, now: Instant) {
        if event.transport == self.primary.id() {
            self.on_primary(event.kind, now);
        } else if self
            .backup
            .as_ref()
            .is_some_and(|backup| backup.id() == event.transport)
        {
            self.on_backup(event.kind, now);
        } else {
            trace!(transport = %event.transport, kind = ?event.kind, "Ignoring event from retired transport");
        }
    }

    fn on_primary(&mut self, kind: TransportEventKind, now: Instant) {
        match kind {
            TransportEventKind::Opened => {
                info!(transport = %self.primary.id(), "Primary open");
                self.events.emit(&ClientEvent::Connected);
                self.correlator.flush(&self.primary, now);
            }

            TransportEventKind::Frame(InboundFrame::Response { nonce, error }) => {
                let request = self.correlator.pending_request(&nonce).cloned();
                self.correlator.on_response(&nonce, outcome(&error));

                // The replay snapshot was taken before this answer arrived.
                if error.is_empty()
                    && !self.pending_replays.is_empty()
                    && let Some(request) = request
                {
                    self.carry_over(request, now);
                }
            }

            TransportEventKind::Frame(InboundFrame::Message { data }) => {
                self.correlator.dispatch_message(&data.topic, &data.message);
            }

            TransportEventKind::Frame(InboundFrame::Reconnect) => {
                if self.reconnecting {
                    debug!("RECONNECT while already reconnecting");
                } else {
                    info!(transport = %self.primary.id(), "Server requested reconnect");
                    self.begin_reconnect();
                }
            }

            TransportEventKind::Frame(InboundFrame::Pong) => {}

            TransportEventKind::HeartbeatMissed => {
                warn!(transport = %self.primary.id(), "Primary missed heartbeat");
            }

            TransportEventKind::ClosedUnexpectedly => {
                warn!(transport = %self.primary.id(), "Primary lost");
                self.events.emit(&ClientEvent::Disconnected);
                self.notify_when_open = true;
                if self.reconnecting {
                    debug!("Reusing backup already in flight");
                } else {
                    self.begin_reconnect();
                }
            }

            TransportEventKind::ClosedIntentionally => {
                debug!(transport = %self.primary.id(), "Primary closed");
            }
        }
    }

    fn on_backup(&mut self, kind: TransportEventKind, now: Instant) {
        match kind {
            TransportEventKind::Opened => {
                let replays = self.correlator.replay_count();
                info!(replays, "Backup open");
                if replays == 0 {
                    self.swap(now);
                } else {
                    self.replay(now);
                }
            }

            TransportEventKind::Frame(InboundFrame::Response { nonce, error }) => {
                let Some(replay) = self.pending_replays.remove(&nonce) else {
                    trace!(%nonce, "Backup response for unknown nonce");
                    return;
                };
                if !error.is_empty() {
                    self.drop_replayed(&replay.record, &error);
                }
                self.swap_if_replayed(now);
            }

            TransportEventKind::Frame(InboundFrame::Message { data }) => {
                trace!(topic = %data.topic, "Message on backup before swap not delivered");
            }

            TransportEventKind::Frame(_) | TransportEventKind::HeartbeatMissed => {}

            TransportEventKind::ClosedUnexpectedly => {
                warn!("Backup lost before swap, dialing another");
                self.pending_replays.clear();
                self.begin_reconnect();
            }

            TransportEventKind::ClosedIntentionally => {
                debug!("Backup closed");
            }
        }
    }

    /// Fails expired requests and replays.
    pub fn expire(&mut self, now: Instant) {
        self.correlator.expire(now);

        let expired: Vec<Nonce> = self
            .pending_replays
            .iter()
            .filter(|(_, replay)| replay.deadline <= now)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        for nonce in expired {
            if let Some(replay) = self.pending_replays.remove(&nonce) {
                self.drop_replayed(&replay.record, "replay timed out");
            }
        }
        self.swap_if_replayed(now);
    }

    /// Earliest request or replay deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let replay = self
            .pending_replays
            .values()
            .map(|replay| replay.deadline)
            .min();
        earliest(self.correlator.next_deadline(), replay)
    }

    // ========================================================================
    // Reconnection
    // ========================================================================

    /// Dials a new backup, replacing any backup in flight.
    fn begin_reconnect(&mut self) {
        self.reconnecting = true;

        let delay = jitter(self.config.reconnect_jitter);
        let mut backup = self.dialer.dial();
        debug!(
            transport = %backup.id(),
            delay_ms = delay.as_millis() as u64,
            "Dialing backup"
        );
        backup.connect(delay);

        if let Some(mut previous) = self.backup.replace(backup) {
            previous.abandon();
        }
    }

    /// Re-issues every acknowledged subscription on the backup.
    fn replay(&mut self, now: Instant) {
        let Some(backup) = self.backup.as_ref() else {
            return;
        };

        let mut failed = Vec::new();
        for record in self.correlator.replay_records() {
            let request = Request {
                nonce: Nonce::generate(),
                kind: RequestKind::Subscribe,
                topic: record.topic.clone(),
                credential: record.credential.clone(),
            };
            trace!(topic = %record.topic, nonce = %request.nonce, "Replaying subscription");

            match backup.send_request(&request) {
                Ok(()) => {
                    self.pending_replays.insert(
                        request.nonce,
                        PendingReplay {
                            record: record.nonce,
                            deadline: now + self.config.response_timeout,
                        },
                    );
                }
                Err(e) => failed.push((record.nonce, e.to_string())),
            }
        }

        for (record, error) in failed {
            self.drop_replayed(&record, &error);
        }
        self.swap_if_replayed(now);
    }

    /// Mirrors a change acknowledged on the old primary onto the backup
    /// being replayed, so the swap does not lose it.
    fn carry_over(&mut self, request: Request, now: Instant) {
        let Some(backup) = self.backup.as_ref() else {
            return;
        };

        let kind = match request.kind {
            RequestKind::Subscribe if self.correlator.has_replay_record(&request.nonce) => {
                RequestKind::Subscribe
            }
            RequestKind::Unsubscribe if self.correlator.registry().count(&request.topic) == 0 => {
                RequestKind::Unsubscribe
            }
            _ => return,
        };

        let mirrored = Request {
            nonce: Nonce::generate(),
            kind,
            topic: request.topic.clone(),
            credential: request.credential.clone(),
        };
        debug!(topic = %request.topic, ?kind, nonce = %mirrored.nonce, "Carrying request over to backup");

        match backup.send_request(&mirrored) {
            Ok(()) => {
                self.pending_replays.insert(
                    mirrored.nonce,
                    PendingReplay {
                        record: request.nonce,
                        deadline: now + self.config.response_timeout,
                    },
                );
            }
            Err(e) => {
                self.drop_replayed(&request.nonce, &e.to_string());
                self.swap_if_replayed(now);
            }
        }
    }

    /// Forgets a subscription whose replay failed and tells the owner.
    fn drop_replayed(&mut self, record: &Nonce, error: &str) {
        if let Some(record) = self.correlator.drop_subscription(record) {
            warn!(topic = %record.topic, error, "Replay failed, subscription dropped");
            self.events.emit(&ClientEvent::SubscriptionDropped {
                topic: record.topic,
            });
        }
    }

    fn swap_if_replayed(&mut self, now: Instant) {
        if self.pending_replays.is_empty() {
            self.swap(now);
        }
    }

    /// Promotes the backup to primary and retires the old primary.
    fn swap(&mut self, now: Instant) {
        let Some(backup) = self.backup.take() else {
            return;
        };

        let mut retired = std::mem::replace(&mut self.primary, backup);
        info!(
            retired = %retired.id(),
            primary = %self.primary.id(),
            "Swapped to backup transport"
        );
        retired.close();

        self.reconnecting = false;
        self.pending_replays.clear();
        self.correlator.flush(&self.primary, now);

        if self.notify_when_open {
            self.notify_when_open = false;
            self.events.emit(&ClientEvent::Connected);
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns `true` while a backup is being prepared.
    #[inline]
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Returns `true` if requests go straight to the wire.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.reconnecting && self.primary.is_ready()
    }

    /// Correlation state.
    #[inline]
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Number of replays awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_replay_count(&self) -> usize {
        self.pending_replays.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
