//! Edge environments and the per-environment session registry.
//!
//! An application usually wants one session per edge environment. The
//! [`SessionRegistry`] builds that session on first use and hands out clones
//! afterwards. The registry is an ordinary value owned by the application.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::core::Session;
use super::options::SessionConfig;

// ============================================================================
// Environment
// ============================================================================

/// Edge deployment a session talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Environment {
    /// Production edge.
    #[default]
    Production,
    /// Pre-release edge.
    Darklaunch,
    /// Local edge.
    Development,
}

impl Environment {
    /// Default edge address.
    #[inline]
    #[must_use]
    pub const fn address(self) -> &'static str {
        match self {
            Self::Production => "wss://pubsub-edge.twitch.tv:443/v1",
            Self::Darklaunch => "wss://pubsub-edge-darklaunch.twitch.tv:443/v1",
            Self::Development => "ws://localhost:6900/v1",
        }
    }

    /// Lowercase name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Darklaunch => "darklaunch",
            Self::Development => "development",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Production),
            "darklaunch" => Ok(Self::Darklaunch),
            "dev" | "development" => Ok(Self::Development),
            _ => Err(Error::config(format!(
                "Unknown environment '{s}'. Expected production, darklaunch or development."
            ))),
        }
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// One lazily built session per environment.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<FxHashMap<Environment, Session>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions use `config`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the session of `environment`, building it on first use.
    ///
    /// A session that was shut down is replaced.
    ///
    /// # Errors
    ///
    /// Returns the builder's validation error.
    pub fn get_or_create(&self, environment: Environment) -> Result<Session> {
        let mut sessions = self.sessions.lock();

        if let Some(session) = sessions.get(&environment)
            && session.is_running()
        {
            return Ok(session.clone());
        }

        info!(%environment, "Creating session");
        let session = Session::builder()
            .environment(environment)
            .config(self.config.clone())
            .build()?;
        sessions.insert(environment, session.clone());
        Ok(session)
    }

    /// Returns the session of `environment` if one was built.
    #[must_use]
    pub fn get(&self, environment: Environment) -> Option<Session> {
        self.sessions.lock().get(&environment).cloned()
    }

    /// Number of sessions built.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no session was built.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Shuts every session down and forgets them.
    pub fn shutdown_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        debug!(count = sessions.len(), "Shutting down sessions");
        for session in sessions {
            session.shutdown();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
