//! Topic → listener registry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::identifiers::ListenerId;

// ============================================================================
// Listener
// ============================================================================

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Message callback registered for a topic.
///
/// Cloning a listener keeps its identity, so the clone passed to
/// `unsubscribe` matches the one passed to `subscribe`.
///
/// # Example
///
/// ```ignore
/// let listener = Listener::new(|payload| println!("got {payload}"));
/// session.subscribe("chat.123", "token", &listener).await?;
/// session.unsubscribe("chat.123", &listener).await?;
/// ```
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    handler: Handler,
}

impl Listener {
    /// Wraps a callback with a fresh identity.
    pub fn new(handler: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        Self {
            id: ListenerId::next(),
            handler: Arc::new(handler),
        }
    }

    /// Returns the listener identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Invokes the callback.
    #[inline]
    pub fn deliver(&self, payload: &Value) {
        (self.handler)(payload);
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id.as_u64()).finish()
    }
}

// ============================================================================
// ListenerRegistry
// ============================================================================

/// Ordered listeners per topic.
///
/// A (topic, listener) pair is stored at most once. Topics without
/// listeners are removed, so `count` is exact.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    topics: FxHashMap<String, Vec<Listener>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` to `topic`. Returns `false` if already present.
    pub fn add(&mut self, topic: &str, listener: Listener) -> bool {
        let listeners = self.topics.entry(topic.to_string()).or_default();
        if listeners.contains(&listener) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes the listener with `id` from `topic`. Returns `false` if absent.
    pub fn remove(&mut self, topic: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|listener| listener.id() != id);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Returns `true` if `topic` has the listener with `id`.
    #[must_use]
    pub fn contains(&self, topic: &str, id: ListenerId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|listeners| listeners.iter().any(|l| l.id() == id))
    }

    /// Number of listeners on `topic`.
    #[inline]
    #[must_use]
    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one listener.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Returns `true` if no topic has listeners.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Iterates topics with listeners, in no particular order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Delivers `payload` to every listener of `topic` in registration order.
    ///
    /// Returns the number of listeners called.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let Some(listeners) = self.topics.get(topic) else {
            return 0;
        };
        for listener in listeners {
            listener.deliver(payload);
        }
        listeners.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
