//! WebSocket connection, heartbeat and event loop.
//!
//! Each [`Transport`] spawns one tokio task that handles:
//!
//! - Dialing, with exponential backoff while the first connection fails
//! - Outgoing frames queued by [`Transport::send`]
//! - Incoming frames, parsed into [`InboundFrame`]s
//! - PING every heartbeat interval and the PONG deadline that follows it
//!
//! All timers live inside the task, so they stop on every exit path.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::clock::sleep_until_deadline;
use crate::error::{Error, Result};
use crate::identifiers::TransportId;
use crate::protocol::{InboundFrame, OutboundFrame, Request};

use super::backoff::backoff_delay;
use super::{Dialer, Link, RequestSink, TransportEvent, TransportEventKind, TransportState};

// ============================================================================
// Constants
// ============================================================================

/// Interval between liveness probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Time allowed for a PONG after each PING.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// First retry delay while the initial connection fails.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Returns `true` for dial errors no retry can fix: the address itself is
/// unusable with this build.
fn is_undialable(error: &WsError) -> bool {
    matches!(
        error,
        WsError::Url(
            UrlError::TlsFeatureNotEnabled
                | UrlError::UnsupportedUrlScheme
                | UrlError::NoHostName
                | UrlError::EmptyHostName
        )
    )
}

/// Timing knobs of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Interval between PINGs once open.
    pub heartbeat_interval: Duration,
    /// Deadline for the PONG answering each PING.
    pub pong_timeout: Duration,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Give up after this many failed dials. `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_connect_attempts: None,
        }
    }
}

/// Commands for the event loop.
enum Outbound {
    /// Serialized frame to write.
    Frame(String),
    /// Close the socket.
    Close,
}

/// State shared between the handle and its event loop.
struct Shared {
    state: Mutex<TransportState>,
    /// `close` was requested.
    closing: AtomicBool,
    /// The owner is going away; report nothing.
    unloading: AtomicBool,
}

// ============================================================================
// Transport
// ============================================================================

/// One WebSocket connection to the edge.
///
/// Events are delivered on the channel given at construction, tagged with
/// [`Transport::id`]. The handle is not `Clone`: exactly one owner decides
/// when it is closed. Dropping it closes the connection silently.
pub struct Transport {
    id: TransportId,
    url: Url,
    config: TransportConfig,
    shared: Arc<Shared>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates an idle transport.
    #[must_use]
    pub fn new(
        url: Url,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            id: TransportId::next(),
            url,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(TransportState::Idle),
                closing: AtomicBool::new(false),
                unloading: AtomicBool::new(false),
            }),
            outbound: None,
            events,
        }
    }

    /// Returns the transport id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.shared.state.lock()
    }

    /// Starts connecting after `delay`.
    ///
    /// No-op unless idle. Must be called within a Tokio runtime.
    pub fn connect(&mut self, delay: Duration) {
        {
            let mut state = self.shared.state.lock();
            if *state != TransportState::Idle {
                debug!(transport = %self.id, state = ?*state, "Connect ignored");
                return;
            }
            *state = TransportState::Connecting;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);

        let event_loop = EventLoop {
            id: self.id,
            url: self.url.clone(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
        };

        tokio::spawn(event_loop.run(outbound_rx, delay));
    }

    /// Sends a frame.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] unless the transport is open
    /// - [`Error::Json`] if the frame cannot be serialized
    pub fn send(&self, frame: &OutboundFrame) -> Result<()> {
        if self.state() != TransportState::Open {
            return Err(Error::NotReady);
        }

        let text = frame.to_text()?;
        trace!(transport = %self.id, frame = %text, "Queueing frame");

        self.outbound
            .as_ref()
            .ok_or(Error::NotReady)?
            .send(Outbound::Frame(text))
            .map_err(|_| Error::NotReady)
    }

    /// Closes the transport intentionally.
    ///
    /// The loss of the connection is then reported as `ClosedIntentionally`.
    pub fn close(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        let mut state = self.shared.state.lock();
        match *state {
            TransportState::Idle => *state = TransportState::Closed,
            TransportState::Connecting | TransportState::Open => {
                debug!(transport = %self.id, "Closing");
                *state = TransportState::Closing;
                if let Some(outbound) = &self.outbound {
                    let _ = outbound.send(Outbound::Close);
                }
            }
            TransportState::Closing | TransportState::Closed => {}
        }
    }

    /// Closes the transport without reporting anything.
    pub fn abandon(&mut self) {
        self.shared.unloading.store(true, Ordering::SeqCst);
        self.close();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl RequestSink for Transport {
    fn send_request(&self, request: &Request) -> Result<()> {
        self.send(&request.to_frame())
    }
}

impl Link for Transport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn state(&self) -> TransportState {
        Transport::state(self)
    }

    fn connect(&mut self, delay: Duration) {
        Transport::connect(self, delay);
    }

    fn send(&self, frame: &OutboundFrame) -> Result<()> {
        Transport::send(self, frame)
    }

    fn close(&mut self) {
        Transport::close(self);
    }

    fn abandon(&mut self) {
        Transport::abandon(self);
    }
}

// ============================================================================
// WsDialer
// ============================================================================

/// Dials [`Transport`]s to one address, all reporting on one channel.
pub struct WsDialer {
    url: Url,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WsDialer {
    /// Creates a dialer.
    #[must_use]
    pub fn new(
        url: Url,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            url,
            config,
            events,
        }
    }
}

impl Dialer for WsDialer {
    type Link = Transport;

    fn dial(&mut self) -> Transport {
        Transport::new(self.url.clone(), self.config.clone(), self.events.clone())
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Task-side half of a transport.
struct EventLoop {
    id: TransportId,
    url: Url,
    config: TransportConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl EventLoop {
    /// Runs the connection to completion, then reports how it ended.
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>, delay: Duration) {
        self.drive(&mut outbound, delay).await;
        self.finish();
    }

    async fn drive(&self, outbound: &mut mpsc::UnboundedReceiver<Outbound>, delay: Duration) {
        if !delay.is_zero() {
            trace!(transport = %self.id, delay_ms = delay.as_millis() as u64, "Delaying connect");
            tokio::select! {
                () = sleep(delay) => {}
                _ = outbound.recv() => return,
            }
        }

        let Some(ws) = self.establish(outbound).await else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            if *state != TransportState::Connecting {
                debug!(transport = %self.id, "Closed during handshake");
                return;
            }
            *state = TransportState::Open;
        }

        info!(transport = %self.id, url = %self.url, "Transport open");
        self.emit(TransportEventKind::Opened);

        self.pump(ws, outbound).await;
    }

    /// Dials until connected, closed, or out of attempts.
    async fn establish(&self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<WsStream> {
        let mut attempt: u32 = 0;

        loop {
            debug!(transport = %self.id, url = %self.url, attempt, "Connecting");

            let result = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = outbound.recv() => return None,
            };

            let error = match result {
                Ok((ws, _response)) => return Some(ws),
                Err(e) => e,
            };

            if is_undialable(&error) {
                error!(transport = %self.id, url = %self.url, error = %error, "Address cannot be dialed");
                return None;
            }

            attempt += 1;
            if let Some(max) = self.config.max_connect_attempts
                && attempt >= max
            {
                warn!(transport = %self.id, error = %error, attempt, "Giving up connecting");
                return None;
            }

            let delay = backoff_delay(
                attempt - 1,
                self.config.initial_backoff,
                self.config.max_backoff,
            );
            warn!(
                transport = %self.id,
                error = %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );

            tokio::select! {
                () = sleep(delay) => {}
                _ = outbound.recv() => return None,
            }
        }
    }

    /// Moves frames until the connection ends.
    async fn pump(&self, ws: WsStream, outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
        let (mut ws_write, mut ws_read) = ws.split();

        let ping = match OutboundFrame::Ping.to_text() {
            Ok(ping) => ping,
            Err(e) => {
                error!(transport = %self.id, error = %e, "Cannot encode PING");
                return;
            }
        };

        // First tick fires immediately: the opening probe.
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_incoming(&text, &mut pong_deadline);
                        }

                        Some(Ok(Message::Close(frame))) => {
                            debug!(transport = %self.id, ?frame, "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(transport = %self.id, error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!(transport = %self.id, "WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = outbound.recv() => {
                    match command {
                        Some(Outbound::Frame(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(transport = %self.id, error = %e, "Failed to send frame");
                                break;
                            }
                        }

                        Some(Outbound::Close) | None => {
                            debug!(transport = %self.id, "Close requested");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    trace!(transport = %self.id, "Sending PING");
                    if let Err(e) = ws_write.send(Message::Text(ping.clone().into())).await {
                        warn!(transport = %self.id, error = %e, "Failed to send PING");
                        break;
                    }
                    pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                }

                () = sleep_until_deadline(pong_deadline) => {
                    warn!(transport = %self.id, "PONG not received in time, closing");
                    self.emit(TransportEventKind::HeartbeatMissed);
                    let _ = ws_write.close().await;
                    break;
                }
            }
        }
    }

    /// Handles one text frame from the edge.
    fn handle_incoming(&self, text: &str, pong_deadline: &mut Option<Instant>) {
        trace!(transport = %self.id, frame = %text, "Frame received");

        match InboundFrame::parse(text) {
            Ok(InboundFrame::Pong) => {
                *pong_deadline = None;
            }
            Ok(frame) => self.emit(TransportEventKind::Frame(frame)),
            Err(e) => {
                debug!(transport = %self.id, error = %e, "Dropping malformed frame");
            }
        }
    }

    /// Marks the transport closed and reports why.
    fn finish(&self) {
        *self.shared.state.lock() = TransportState::Closed;

        if self.shared.unloading.load(Ordering::SeqCst) {
            debug!(transport = %self.id, "Transport closed while unloading");
            return;
        }

        if self.shared.closing.load(Ordering::SeqCst) {
            debug!(transport = %self.id, "Transport closed");
            self.emit(TransportEventKind::ClosedIntentionally);
        } else {
            warn!(transport = %self.id, "Transport closed unexpectedly");
            self.emit(TransportEventKind::ClosedUnexpectedly);
        }
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent::new(self.id, kind));
    }
}

// ============================================================================
// Tests
// ============================================================================
