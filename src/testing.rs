//! In-process mock of the pub/sub edge for tests.
//!
//! [`MockEdge`] accepts WebSocket connections on a loopback port, records
//! every frame clients send, and by default answers the way the real edge
//! does: PONG for PING and an empty-error RESPONSE for LISTEN / UNLISTEN.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An address nothing listens on.
pub fn unreachable_url() -> Url {
    Url::parse("ws://127.0.0.1:1/v1").expect("static url")
}

struct EdgeState {
    auto_pong: AtomicBool,
    auto_ack: AtomicBool,
    rejections: Mutex<FxHashMap<String, String>>,
    connections: Mutex<Vec<Option<mpsc::UnboundedSender<Message>>>>,
}

impl EdgeState {
    fn reply(&self, index: usize, value: &Value) {
        let connections = self.connections.lock();
        if let Some(Some(tx)) = connections.get(index) {
            let _ = tx.send(Message::Text(value.to_string().into()));
        }
    }

    fn auto_reply(&self, index: usize, frame: &Value) {
        match frame["type"].as_str() {
            Some("PING") if self.auto_pong.load(Ordering::SeqCst) => {
                self.reply(index, &json!({ "type": "PONG" }));
            }
            Some(kind @ ("LISTEN" | "UNLISTEN")) if self.auto_ack.load(Ordering::SeqCst) => {
                let topic = frame["data"]["topics"][0].as_str().unwrap_or_default();
                let error = if kind == "LISTEN" {
                    self.rejections.lock().get(topic).cloned().unwrap_or_default()
                } else {
                    String::new()
                };
                self.reply(
                    index,
                    &json!({ "type": "RESPONSE", "nonce": frame["nonce"], "error": error }),
                );
            }
            _ => {}
        }
    }
}

/// Loopback WebSocket server standing in for the edge.
pub struct MockEdge {
    url: Url,
    state: Arc<EdgeState>,
    frames: mpsc::UnboundedReceiver<(usize, Value)>,
}

impl MockEdge {
    /// Binds a free port and starts accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/v1")).expect("url");

        let state = Arc::new(EdgeState {
            auto_pong: AtomicBool::new(true),
            auto_ack: AtomicBool::new(true),
            rejections: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(Vec::new()),
        });
        let (frames_tx, frames) = mpsc::unbounded_channel();

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                let index = {
                    let mut connections = accept_state.connections.lock();
                    connections.push(Some(tx));
                    connections.len() - 1
                };
                tokio::spawn(serve(
                    stream,
                    index,
                    rx,
                    Arc::clone(&accept_state),
                    frames_tx.clone(),
                ));
            }
        });

        Self { url, state, frames }
    }

    /// Address clients should dial.
    pub fn url(&self) -> Url {
        self.url.clone()
    }

    /// Number of TCP connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Toggles automatic PONG replies.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Toggles automatic RESPONSE replies.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Answers LISTEN on `topic` with `error` from now on.
    pub fn reject_topic(&self, topic: &str, error: &str) {
        self.state
            .rejections
            .lock()
            .insert(topic.to_string(), error.to_string());
    }

    /// Sends a frame to connection `index`.
    pub fn push(&self, index: usize, frame: Value) {
        self.state.reply(index, &frame);
    }

    /// Sends a frame to every open connection.
    pub fn broadcast(&self, frame: Value) {
        let text = frame.to_string();
        for tx in self.state.connections.lock().iter().flatten() {
            let _ = tx.send(Message::Text(text.clone().into()));
        }
    }

    /// Closes connection `index` from the server side.
    pub fn drop_connection(&self, index: usize) {
        let tx = self
            .state
            .connections
            .lock()
            .get_mut(index)
            .and_then(Option::take);
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Waits for the next frame from any connection.
    pub async fn next_frame(&mut self) -> (usize, Value) {
        timeout(FRAME_WAIT, self.frames.recv())
            .await
            .expect("frame in time")
            .expect("edge running")
    }

    /// Waits for the next frame of the given `type`, skipping others.
    pub async fn next_frame_of(&mut self, kind: &str) -> (usize, Value) {
        loop {
            let (index, frame) = self.next_frame().await;
            if frame["type"] == kind {
                return (index, frame);
            }
        }
    }

    /// Collects frames of the given `type` until none of that type arrive
    /// for `quiet`. Other frames do not extend the wait.
    pub async fn frames_of_until_quiet(&mut self, kind: &str, quiet: Duration) -> Vec<(usize, Value)> {
        let mut collected = Vec::new();
        let mut deadline = Instant::now() + quiet;
        while let Ok(Some((index, frame))) = timeout_at(deadline, self.frames.recv()).await {
            if frame["type"] == kind {
                collected.push((index, frame));
                deadline = Instant::now() + quiet;
            }
        }
        collected
    }
}

async fn serve(
    stream: TcpStream,
    index: usize,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    state: Arc<EdgeState>,
    frames: mpsc::UnboundedSender<(usize, Value)>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || is_close {
                break;
            }
        }
    });

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.auto_reply(index, &frame);
        let _ = frames.send((index, frame));
    }
}
