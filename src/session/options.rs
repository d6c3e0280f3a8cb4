//! Session timing and trust configuration.
//!
//! Every knob has the value the production edge expects, so most callers
//! never touch it. Tests shrink the timers to keep runs short.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use pubsub_client::SessionConfig;
//!
//! let config = SessionConfig::new()
//!     .with_heartbeat_interval(Duration::from_secs(60))
//!     .with_max_connect_attempts(5)
//!     .with_trusted_origin(r"^https://example\.com/");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::correlation::DEFAULT_RESPONSE_TIMEOUT;
use crate::error::{Error, Result};
use crate::proxy::{ConsumerConfig, DEFAULT_ORPHAN_SWEEP_INTERVAL, DEFAULT_VERIFY_TIMEOUT, OriginPolicy};
use crate::reconnect::{CoordinatorConfig, DEFAULT_RECONNECT_JITTER};
use crate::transport::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_PONG_TIMEOUT,
    TransportConfig,
};

// ============================================================================
// SessionConfig
// ============================================================================

/// Timers, retry limits and trusted origins of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Interval between PINGs on an open connection.
    pub heartbeat_interval: Duration,

    /// Deadline for the PONG answering each PING.
    pub pong_timeout: Duration,

    /// Deadline for each request and each replay.
    pub response_timeout: Duration,

    /// First reconnection backoff delay.
    pub initial_backoff: Duration,

    /// Reconnection backoff cap.
    pub max_backoff: Duration,

    /// Give up after this many failed dials. `None` retries forever.
    pub max_connect_attempts: Option<u32>,

    /// Upper bound of the random delay before a backup connection dials.
    pub reconnect_jitter: Duration,

    /// Time a proxy host has to answer the trust handshake.
    pub verify_timeout: Duration,

    /// Interval at which a proxy host drops subscriptions of dead consumers.
    pub orphan_sweep_interval: Duration,

    /// Regex sources of trusted origins. Empty means the built-in pattern.
    pub trusted_origins: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl SessionConfig {
    /// Creates a configuration with production defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_connect_attempts: None,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            orphan_sweep_interval: DEFAULT_ORPHAN_SWEEP_INTERVAL,
            trusted_origins: Vec::new(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl SessionConfig {
    /// Sets the heartbeat interval.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the PONG deadline.
    #[inline]
    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Sets the request deadline.
    #[inline]
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the backoff bounds.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Caps the number of failed dials before a transport gives up.
    #[inline]
    #[must_use]
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = Some(attempts);
        self
    }

    /// Sets the upper bound of the backup dial jitter.
    #[inline]
    #[must_use]
    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Sets the trust handshake deadline.
    #[inline]
    #[must_use]
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Sets the orphan sweep interval.
    #[inline]
    #[must_use]
    pub fn with_orphan_sweep_interval(mut self, interval: Duration) -> Self {
        self.orphan_sweep_interval = interval;
        self
    }

    /// Adds a trusted origin pattern.
    #[inline]
    #[must_use]
    pub fn with_trusted_origin(mut self, pattern: impl Into<String>) -> Self {
        self.trusted_origins.push(pattern.into());
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl SessionConfig {
    /// Transport timers.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            heartbeat_interval: self.heartbeat_interval,
            pong_timeout: self.pong_timeout,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            max_connect_attempts: self.max_connect_attempts,
        }
    }

    /// Coordinator timers.
    #[inline]
    #[must_use]
    pub const fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            response_timeout: self.response_timeout,
            reconnect_jitter: self.reconnect_jitter,
        }
    }

    /// Proxy consumer timers.
    #[inline]
    #[must_use]
    pub const fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            response_timeout: self.response_timeout,
            verify_timeout: self.verify_timeout,
        }
    }

    /// Compiles the trusted origins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Regex`] if a pattern does not compile.
    pub fn origin_policy(&self) -> Result<OriginPolicy> {
        if self.trusted_origins.is_empty() {
            Ok(OriginPolicy::default())
        } else {
            OriginPolicy::new(&self.trusted_origins)
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a timer or backoff bound is zero, the
    /// backoff bounds are inverted, or the attempt cap is zero. Returns
    /// [`Error::Regex`] if an origin pattern does not compile.
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("pong_timeout", self.pong_timeout),
            ("response_timeout", self.response_timeout),
            ("initial_backoff", self.initial_backoff),
            ("max_backoff", self.max_backoff),
            ("verify_timeout", self.verify_timeout),
            ("orphan_sweep_interval", self.orphan_sweep_interval),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(Error::config(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if self.max_connect_attempts == Some(0) {
            return Err(Error::config(
                "max_connect_attempts must be at least 1. Use None to retry forever.",
            ));
        }

        self.origin_policy()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
