//! Caller-facing sessions.
//!
//! This module provides the entry point for applications.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Session`] | Subscribe, unsubscribe and connection events |
//! | [`SessionBuilder`] | Fluent configuration builder |
//! | [`SessionConfig`] | Timers, retry limits and trusted origins |
//! | [`SessionRegistry`] | One session per [`Environment`] |
//!
//! # Example
//!
//! ```no_run
//! use pubsub_client::{Environment, Listener, SessionConfig, SessionRegistry};
//!
//! # async fn example() -> pubsub_client::Result<()> {
//! let registry = SessionRegistry::new(SessionConfig::new());
//! let session = registry.get_or_create(Environment::Production)?;
//!
//! let listener = Listener::new(|payload| println!("{payload}"));
//! session.subscribe("video-playback.1234", "token", &listener).await?;
//! session.unsubscribe("video-playback.1234", &listener).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for session configuration.
pub mod builder;

/// Session handle and actor.
pub mod core;

/// Session timers and trust.
pub mod options;

/// Environments and the session registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::SessionBuilder;
pub use core::Session;
pub use options::SessionConfig;
pub use registry::{Environment, SessionRegistry};
