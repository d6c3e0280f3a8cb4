//! Request/response correlation state machine.
//!
//! The [`Correlator`] is synchronous: its owner passes the current time and,
//! when there is somewhere to send, a [`RequestSink`]. Passing `None` queues
//! the request until the next [`Correlator::flush`].

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::result::Result as StdResult;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::identifiers::Nonce;
use crate::protocol::{Request, RequestKind};
use crate::transport::RequestSink;

use super::pending::{PendingRequest, PendingRequests, ReplayRecord, ReplayRecords};
use super::registry::ListenerRegistry;
use super::{Completion, Listener};

// ============================================================================
// Constants
// ============================================================================

/// Time allowed for a response before a request fails.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Correlator
// ============================================================================

/// Tracks outstanding requests, queued requests, listeners and replay
/// records for one client.
#[derive(Debug)]
pub struct Correlator {
    registry: ListenerRegistry,
    pending: PendingRequests,
    replays: ReplayRecords,
    queue: VecDeque<PendingRequest>,
    response_timeout: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl Correlator {
    /// Creates a correlator with the given response timeout.
    #[must_use]
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            pending: PendingRequests::default(),
            replays: ReplayRecords::default(),
            queue: VecDeque::new(),
            response_timeout,
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Issues a subscribe request under a fresh token.
    ///
    /// Every call produces exactly one request; duplicates are resolved when
    /// the response arrives.
    pub fn subscribe(
        &mut self,
        topic: &str,
        credential: &str,
        listener: Listener,
        completion: Completion,
        sink: Option<&dyn RequestSink>,
        now: Instant,
    ) {
        let request = Request {
            nonce: Nonce::generate(),
            kind: RequestKind::Subscribe,
            topic: topic.to_string(),
            credential: Some(credential.to_string()),
        };
        debug!(topic, nonce = %request.nonce, "Subscribe");
        self.submit(PendingRequest::new(request, listener, completion), sink, now);
    }

    /// Issues an unsubscribe request, or resolves it locally when other
    /// listeners keep the topic alive.
    ///
    /// A listener that is not registered on a live topic changes nothing and
    /// is acknowledged without wire traffic.
    pub fn unsubscribe(
        &mut self,
        topic: &str,
        listener: Listener,
        completion: Completion,
        sink: Option<&dyn RequestSink>,
        now: Instant,
    ) {
        let count = self.registry.count(topic);
        if count > 0 && !self.registry.contains(topic, listener.id()) {
            debug!(topic, count, listener = %listener.id(), "Unsubscribe for unregistered listener");
            completion(Ok(()));
            return;
        }
        if count > 1 {
            debug!(topic, count, "Unsubscribe resolved locally");
            self.registry.remove(topic, listener.id());
            self.replays.remove_matching(topic, listener.id());
            completion(Ok(()));
            return;
        }

        let request = Request {
            nonce: Nonce::generate(),
            kind: RequestKind::Unsubscribe,
            topic: topic.to_string(),
            credential: None,
        };
        debug!(topic, nonce = %request.nonce, "Unsubscribe");
        self.submit(PendingRequest::new(request, listener, completion), sink, now);
    }

    fn submit(&mut self, request: PendingRequest, sink: Option<&dyn RequestSink>, now: Instant) {
        match sink {
            Some(sink) => self.transmit(request, sink, now),
            None => {
                trace!(nonce = %request.request.nonce, queued = self.queue.len() + 1, "Queueing request");
                self.queue.push_back(request);
            }
        }
    }

    fn transmit(&mut self, request: PendingRequest, sink: &dyn RequestSink, now: Instant) {
        match sink.send_request(&request.request) {
            Ok(()) => self.pending.insert(request, now + self.response_timeout),
            Err(e) => {
                warn!(nonce = %request.request.nonce, error = %e, "Request could not be sent");
                request.complete(Err(e));
            }
        }
    }

    /// Sends every queued request in FIFO order.
    pub fn flush(&mut self, sink: &dyn RequestSink, now: Instant) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "Flushing queued requests");
        }
        while let Some(request) = self.queue.pop_front() {
            self.transmit(request, sink, now);
        }
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Resolves the request with `nonce`.
    ///
    /// Returns `false` for unknown tokens, which are ignored.
    pub fn on_response(&mut self, nonce: &Nonce, outcome: StdResult<(), String>) -> bool {
        let Some(pending) = self.pending.remove(nonce) else {
            trace!(%nonce, "Response for unknown nonce");
            return false;
        };

        match outcome {
            Ok(()) => {
                let request = &pending.request;
                match request.kind {
                    RequestKind::Subscribe => {
                        if self.registry.add(&request.topic, pending.listener.clone()) {
                            self.replays.insert(ReplayRecord {
                                nonce: request.nonce.clone(),
                                topic: request.topic.clone(),
                                credential: request.credential.clone(),
                                listener: pending.listener.clone(),
                            });
                        }
                    }
                    RequestKind::Unsubscribe => {
                        self.replays
                            .remove_matching(&request.topic, pending.listener.id());
                        self.registry.remove(&request.topic, pending.listener.id());
                    }
                }
                debug!(%nonce, topic = %request.topic, "Request succeeded");
                pending.complete(Ok(()));
            }
            Err(message) => {
                warn!(%nonce, topic = %pending.request.topic, error = %message, "Request rejected");
                pending.complete(Err(Error::server_rejected(message)));
            }
        }
        true
    }

    /// Fails every request whose deadline has passed. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.pending.take_expired(now);
        let count = expired.len();
        let timeout_ms = self.response_timeout.as_millis() as u64;

        for pending in expired {
            let nonce = pending.request.nonce.clone();
            warn!(%nonce, topic = %pending.request.topic, "Request timed out");
            pending.complete(Err(Error::response_timeout(nonce, timeout_ms)));
        }
        count
    }

    /// Earliest response deadline.
    #[inline]
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Fails every pending and queued request with `ConnectionClosed`.
    pub fn fail_all(&mut self) {
        let pending = self.pending.drain();
        let queued: Vec<_> = self.queue.drain(..).collect();
        if !pending.is_empty() || !queued.is_empty() {
            debug!(pending = pending.len(), queued = queued.len(), "Failing outstanding requests");
        }
        for request in pending.into_iter().chain(queued) {
            request.complete(Err(Error::ConnectionClosed));
        }
    }

    // ========================================================================
    // Messages & Replay
    // ========================================================================

    /// Delivers an inbound message to the listeners of `topic`.
    pub fn dispatch_message(&self, topic: &str, payload: &Value) -> usize {
        let delivered = self.registry.dispatch(topic, payload);
        trace!(topic, delivered, "Message dispatched");
        delivered
    }

    /// The outstanding request with `nonce`, if any.
    #[must_use]
    pub fn pending_request(&self, nonce: &Nonce) -> Option<&Request> {
        self.pending.get(nonce)
    }

    /// Returns `true` if the subscribe with `nonce` left a replay record.
    #[inline]
    #[must_use]
    pub fn has_replay_record(&self, nonce: &Nonce) -> bool {
        self.replays.contains(nonce)
    }

    /// Snapshot of the subscriptions to re-issue on a new connection.
    #[must_use]
    pub fn replay_records(&self) -> Vec<ReplayRecord> {
        self.replays.iter().cloned().collect()
    }

    /// Forgets the subscription created by `nonce`, listener included.
    pub fn drop_subscription(&mut self, nonce: &Nonce) -> Option<ReplayRecord> {
        let record = self.replays.remove(nonce)?;
        self.registry.remove(&record.topic, record.listener.id());
        Some(record)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Listener registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests waiting for a sink.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of acknowledged subscriptions.
    #[inline]
    #[must_use]
    pub fn replay_count(&self) -> usize {
        self.replays.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rustc_hash::FxHashSet;
    use serde_json::json;

    use crate::error::Result;

    /// Records requests; optionally refuses them.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Request>>,
        refuse: bool,
    }

    impl RequestSink for RecordingSink {
        fn send_request(&self, request: &Request) -> Result<()> {
            if self.refuse {
                return Err(Error::NotReady);
            }
            self.sent.lock().push(request.clone());
            Ok(())
        }
    }

    impl RecordingSink {
        fn last_nonce(&self) -> Nonce {
            self.sent.lock().last().expect("request sent").nonce.clone()
        }

        fn kinds(&self) -> Vec<(RequestKind, String)> {
            self.sent
                .lock()
                .iter()
                .map(|r| (r.kind, r.topic.clone()))
                .collect()
        }
    }

    type Outcomes = Arc<Mutex<Vec<std::result::Result<(), String>>>>;

    fn recorder() -> (Outcomes, impl Fn() -> Completion) {
        let outcomes: Outcomes = Arc::default();
        let make = {
            let outcomes = Arc::clone(&outcomes);
            move || -> Completion {
                let outcomes = Arc::clone(&outcomes);
                Box::new(move |result: Result<()>| {
                    outcomes.lock().push(result.map_err(|e| e.to_string()));
                })
            }
        };
        (outcomes, make)
    }

    fn subscribed(correlator: &mut Correlator, sink: &RecordingSink, topic: &str, listener: &Listener) {
        let now = Instant::now();
        correlator.subscribe(topic, "cred", listener.clone(), Box::new(|_| {}), Some(sink), now);
        assert!(correlator.on_response(&sink.last_nonce(), Ok(())));
    }

    #[test]
    fn test_queued_while_disconnected_then_flushed_once() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let (outcomes, completion) = recorder();
        let now = Instant::now();

        correlator.subscribe("chat.123", "cred", Listener::new(|_| {}), completion(), None, now);
        assert_eq!(correlator.queued_count(), 1);
        assert!(outcomes.lock().is_empty());

        correlator.flush(&sink, now);
        assert_eq!(sink.kinds(), vec![(RequestKind::Subscribe, "chat.123".to_string())]);
        assert_eq!(correlator.queued_count(), 0);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_flush_preserves_order() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let now = Instant::now();

        for topic in ["a", "b", "c"] {
            correlator.subscribe(topic, "cred", Listener::new(|_| {}), Box::new(|_| {}), None, now);
        }
        correlator.flush(&sink, now);

        let topics: Vec<String> = sink.kinds().into_iter().map(|(_, t)| t).collect();
        assert_eq!(topics, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_two_listeners_two_requests_local_unsubscribe() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let first = Listener::new(|_| {});
        let second = Listener::new(|_| {});

        subscribed(&mut correlator, &sink, "chat.123", &first);
        subscribed(&mut correlator, &sink, "chat.123", &second);
        assert_eq!(sink.kinds().len(), 2);
        assert_eq!(correlator.registry().count("chat.123"), 2);
        assert_eq!(correlator.replay_count(), 2);

        let (outcomes, completion) = recorder();
        correlator.unsubscribe("chat.123", first, completion(), Some(&sink), Instant::now());

        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert_eq!(sink.kinds().len(), 2, "no UNLISTEN while another listener remains");
        assert_eq!(correlator.registry().count("chat.123"), 1);
        assert_eq!(correlator.replay_count(), 1);
    }

    #[test]
    fn test_last_unsubscribe_goes_to_wire() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let listener = Listener::new(|_| {});
        subscribed(&mut correlator, &sink, "chat.123", &listener);

        let (outcomes, completion) = recorder();
        correlator.unsubscribe("chat.123", listener, completion(), Some(&sink), Instant::now());
        assert_eq!(sink.kinds().last(), Some(&(RequestKind::Unsubscribe, "chat.123".to_string())));
        assert_eq!(correlator.registry().count("chat.123"), 1);

        assert!(correlator.on_response(&sink.last_nonce(), Ok(())));
        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert_eq!(correlator.registry().count("chat.123"), 0);
        assert_eq!(correlator.replay_count(), 0);
    }

    #[test]
    fn test_unregistered_listener_unsubscribe_is_local() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let live = Listener::new(|_| {});
        subscribed(&mut correlator, &sink, "chat.123", &live);

        let (outcomes, completion) = recorder();
        let stranger = Listener::new(|_| {});
        correlator.unsubscribe("chat.123", stranger, completion(), Some(&sink), Instant::now());

        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert_eq!(sink.kinds().len(), 1, "no UNLISTEN for a listener that never subscribed");
        assert_eq!(correlator.registry().count("chat.123"), 1);
        assert_eq!(correlator.replay_count(), 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_subscribe_keeps_single_replay() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let listener = Listener::new(|_| {});

        subscribed(&mut correlator, &sink, "chat.123", &listener);
        subscribed(&mut correlator, &sink, "chat.123", &listener);

        assert_eq!(sink.kinds().len(), 2);
        assert_eq!(correlator.registry().count("chat.123"), 1);
        assert_eq!(correlator.replay_count(), 1);
    }

    #[test]
    fn test_server_error_rejects_without_registering() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let (outcomes, completion) = recorder();

        correlator.subscribe("chat.1", "bad", Listener::new(|_| {}), completion(), Some(&sink), Instant::now());
        correlator.on_response(&sink.last_nonce(), Err("ERR_BADAUTH".to_string()));

        assert_eq!(
            *outcomes.lock(),
            vec![Err("Server rejected request: ERR_BADAUTH".to_string())]
        );
        assert_eq!(correlator.registry().count("chat.1"), 0);
        assert_eq!(correlator.replay_count(), 0);
    }

    #[test]
    fn test_unknown_nonce_ignored() {
        let mut correlator = Correlator::default();
        assert!(!correlator.on_response(&Nonce::from("stranger"), Ok(())));
    }

    #[test]
    fn test_timeout_fails_request() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let sink = RecordingSink::default();
        let (outcomes, completion) = recorder();
        let now = Instant::now();

        correlator.subscribe("chat.1", "cred", Listener::new(|_| {}), completion(), Some(&sink), now);
        assert_eq!(correlator.next_deadline(), Some(now + Duration::from_secs(30)));

        assert_eq!(correlator.expire(now + Duration::from_secs(29)), 0);
        assert_eq!(correlator.expire(now + Duration::from_secs(30)), 1);

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().is_err_and(|e| e.contains("timed out after 30000ms")));
        drop(outcomes);

        // Late response is ignored.
        assert!(!correlator.on_response(&sink.last_nonce(), Ok(())));
        assert_eq!(correlator.next_deadline(), None);
    }

    #[test]
    fn test_refused_send_fails_immediately() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink {
            refuse: true,
            ..Default::default()
        };
        let (outcomes, completion) = recorder();

        correlator.subscribe("chat.1", "cred", Listener::new(|_| {}), completion(), Some(&sink), Instant::now());

        assert_eq!(*outcomes.lock(), vec![Err("Transport not ready".to_string())]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_tokens_unique_among_pending() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let now = Instant::now();
        for _ in 0..50 {
            correlator.subscribe("chat.1", "cred", Listener::new(|_| {}), Box::new(|_| {}), Some(&sink), now);
        }
        assert_eq!(correlator.pending_count(), 50);
    }

    #[test]
    fn test_dispatch_and_drop_subscription() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let received = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let received = Arc::clone(&received);
            Listener::new(move |payload| received.lock().push(payload.clone()))
        };
        subscribed(&mut correlator, &sink, "chat.1", &listener);

        assert_eq!(correlator.dispatch_message("chat.1", &json!({"n": 1})), 1);
        assert_eq!(*received.lock(), vec![json!({"n": 1})]);

        let record = correlator.replay_records().pop().expect("record");
        assert!(correlator.drop_subscription(&record.nonce).is_some());
        assert_eq!(correlator.dispatch_message("chat.1", &json!({"n": 2})), 0);
        assert_eq!(correlator.replay_count(), 0);
    }

    #[test]
    fn test_fail_all() {
        let mut correlator = Correlator::default();
        let sink = RecordingSink::default();
        let (outcomes, completion) = recorder();
        let now = Instant::now();

        correlator.subscribe("a", "cred", Listener::new(|_| {}), completion(), Some(&sink), now);
        correlator.subscribe("b", "cred", Listener::new(|_| {}), completion(), None, now);
        correlator.fail_all();

        assert_eq!(
            *outcomes.lock(),
            vec![Err("Connection closed".to_string()), Err("Connection closed".to_string())]
        );
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.queued_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Subscribe { listener: usize, topic: usize, accept: bool },
        Unsubscribe { listener: usize, topic: usize, accept: bool },
    }

    fn op() -> impl Strategy<Value = Op> {
        (any::<bool>(), 0usize..3, 0usize..2, prop::bool::weighted(0.8)).prop_map(
            |(subscribe, listener, topic, accept)| {
                if subscribe {
                    Op::Subscribe { listener, topic, accept }
                } else {
                    Op::Unsubscribe { listener, topic, accept }
                }
            },
        )
    }

    fn verdict(accept: bool) -> std::result::Result<(), String> {
        if accept {
            Ok(())
        } else {
            Err("ERR_BADAUTH".to_string())
        }
    }

    proptest! {
        #[test]
        fn test_unlisten_only_when_last_listener_leaves(ops in prop::collection::vec(op(), 0..64)) {
            let listeners: Vec<Listener> = (0..3).map(|_| Listener::new(|_| {})).collect();
            let topics = ["a", "b"];
            let mut correlator = Correlator::default();
            let sink = RecordingSink::default();
            let now = Instant::now();
            let mut model: FxHashSet<(usize, usize)> = FxHashSet::default();

            for op in ops {
                match op {
                    Op::Subscribe { listener, topic, accept } => {
                        correlator.subscribe(
                            topics[topic],
                            "cred",
                            listeners[listener].clone(),
                            Box::new(|_| {}),
                            Some(&sink),
                            now,
                        );
                        correlator.on_response(&sink.last_nonce(), verdict(accept));
                        if accept {
                            model.insert((listener, topic));
                        }
                    }
                    Op::Unsubscribe { listener, topic, accept } => {
                        let before = correlator.registry().count(topics[topic]);
                        let registered = model.contains(&(listener, topic));
                        let sent = sink.sent.lock().len();

                        correlator.unsubscribe(
                            topics[topic],
                            listeners[listener].clone(),
                            Box::new(|_| {}),
                            Some(&sink),
                            now,
                        );
                        let on_wire = sink.sent.lock().len() > sent;
                        prop_assert_eq!(on_wire, before == 0 || (before == 1 && registered));

                        if on_wire {
                            correlator.on_response(&sink.last_nonce(), verdict(accept));
                            if accept {
                                model.remove(&(listener, topic));
                            }
                        } else {
                            model.remove(&(listener, topic));
                        }

                        let after = correlator.registry().count(topics[topic]);
                        if before == 1 && after == 0 {
                            prop_assert!(on_wire);
                        }
                    }
                }

                for (t, topic) in topics.iter().enumerate() {
                    let expected = model.iter().filter(|(_, mt)| *mt == t).count();
                    prop_assert_eq!(correlator.registry().count(topic), expected);
                }
                prop_assert_eq!(correlator.replay_count(), model.len());
                prop_assert_eq!(correlator.pending_count(), 0);
            }
        }
    }
}
