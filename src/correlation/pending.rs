//! Outstanding requests and the subscriptions to replay.

// ============================================================================
// Imports
// ============================================================================

use tokio::time::Instant;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::identifiers::{ListenerId, Nonce};
use crate::protocol::Request;

use super::{Completion, Listener};

// ============================================================================
// PendingRequest
// ============================================================================

/// A request waiting to be sent or answered.
pub struct PendingRequest {
    /// What was asked.
    pub request: Request,
    /// Listener the request concerns.
    pub listener: Listener,
    completion: Completion,
}

impl PendingRequest {
    /// Creates a pending request.
    pub fn new(request: Request, listener: Listener, completion: Completion) -> Self {
        Self {
            request,
            listener,
            completion,
        }
    }

    /// Invokes the completion.
    pub fn complete(self, result: Result<()>) {
        (self.completion)(result);
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request", &self.request)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PendingRequests
// ============================================================================

/// In-flight requests keyed by token, each with a response deadline.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: FxHashMap<Nonce, (PendingRequest, Instant)>,
}

impl PendingRequests {
    /// Tracks `request` until `deadline`.
    pub fn insert(&mut self, request: PendingRequest, deadline: Instant) {
        self.entries
            .insert(request.request.nonce.clone(), (request, deadline));
    }

    /// Stops tracking the request with `nonce`.
    pub fn remove(&mut self, nonce: &Nonce) -> Option<PendingRequest> {
        self.entries.remove(nonce).map(|(request, _)| request)
    }

    /// Removes and returns every request whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<Nonce> = self
            .entries
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(nonce, _)| nonce.clone())
            .collect();

        expired.iter().filter_map(|nonce| self.remove(nonce)).collect()
    }

    /// Earliest deadline, if any request is outstanding.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(_, deadline)| *deadline).min()
    }

    /// Removes every request.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.entries.drain().map(|(_, (request, _))| request).collect()
    }

    /// The request with `nonce`, if outstanding.
    #[must_use]
    pub fn get(&self, nonce: &Nonce) -> Option<&Request> {
        self.entries.get(nonce).map(|(pending, _)| &pending.request)
    }

    /// Returns `true` if `nonce` is outstanding.
    #[inline]
    #[must_use]
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.entries.contains_key(nonce)
    }

    /// Number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// ReplayRecords
// ============================================================================

/// An acknowledged subscription, kept so it can be re-issued on a new
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    /// Token of the subscribe that created it.
    pub nonce: Nonce,
    /// Topic.
    pub topic: String,
    /// Credential to subscribe with again.
    pub credential: Option<String>,
    /// Listener the subscription delivers to.
    pub listener: Listener,
}

/// Replay records keyed by the token that created them.
#[derive(Debug, Default)]
pub struct ReplayRecords {
    records: FxHashMap<Nonce, ReplayRecord>,
}

impl ReplayRecords {
    /// Adds a record.
    pub fn insert(&mut self, record: ReplayRecord) {
        self.records.insert(record.nonce.clone(), record);
    }

    /// Removes the record created by `nonce`.
    pub fn remove(&mut self, nonce: &Nonce) -> Option<ReplayRecord> {
        self.records.remove(nonce)
    }

    /// Returns `true` if a record was created by `nonce`.
    #[inline]
    #[must_use]
    pub fn contains(&self, nonce: &Nonce) -> bool {
        self.records.contains_key(nonce)
    }

    /// Removes the record for (`topic`, `listener`).
    pub fn remove_matching(&mut self, topic: &str, listener: ListenerId) -> Option<ReplayRecord> {
        let nonce = self
            .records
            .values()
            .find(|record| record.topic == topic && record.listener.id() == listener)
            .map(|record| record.nonce.clone())?;
        self.records.remove(&nonce)
    }

    /// Iterates all records.
    pub fn iter(&self) -> impl Iterator<Item = &ReplayRecord> {
        self.records.values()
    }

    /// Number of records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if there is nothing to replay.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::protocol::RequestKind;

    fn pending(nonce: &str) -> PendingRequest {
        PendingRequest::new(
            Request {
                nonce: Nonce::from(nonce),
                kind: RequestKind::Subscribe,
                topic: "chat.1".to_string(),
                credential: None,
            },
            Listener::new(|_| {}),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn test_expiry_and_next_deadline() {
        let now = Instant::now();
        let mut requests = PendingRequests::default();
        requests.insert(pending("early"), now + Duration::from_secs(1));
        requests.insert(pending("late"), now + Duration::from_secs(5));

        assert_eq!(requests.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(requests.take_expired(now).is_empty());

        let expired = requests.take_expired(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request.nonce.as_str(), "early");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_remove_unknown_nonce() {
        let mut requests = PendingRequests::default();
        assert!(requests.remove(&Nonce::from("nope")).is_none());
        assert_eq!(requests.next_deadline(), None);
    }

    #[test]
    fn test_replay_remove_matching() {
        let listener = Listener::new(|_| {});
        let other = Listener::new(|_| {});
        let mut records = ReplayRecords::default();
        for (nonce, topic, l) in [("n1", "a", &listener), ("n2", "b", &listener), ("n3", "a", &other)] {
            records.insert(ReplayRecord {
                nonce: Nonce::from(nonce),
                topic: topic.to_string(),
                credential: None,
                listener: l.clone(),
            });
        }

        let removed = records.remove_matching("a", listener.id()).expect("record");
        assert_eq!(removed.nonce.as_str(), "n1");
        assert!(records.remove_matching("a", listener.id()).is_none());
        assert_eq!(records.len(), 2);
    }
}
