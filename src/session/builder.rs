//! Builder pattern for session configuration.
//!
//! # Example
//!
//! ```no_run
//! use pubsub_client::{Environment, Session};
//!
//! # async fn example() -> pubsub_client::Result<()> {
//! let session = Session::builder()
//!     .environment(Environment::Production)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, info};
use url::Url;

use crate::client::ClientHandle;
use crate::error::{Error, Result};
use crate::proxy::{Context, ContextHandle, OriginPolicy, ProxyHost, ProxyHostHandle, spawn_consumer};
use crate::reconnect::spawn_direct;

use super::core::Session;
use super::options::SessionConfig;
use super::registry::Environment;

// ============================================================================
// SessionBuilder
// ============================================================================

/// Builder for a [`Session`].
///
/// Use [`Session::builder()`] to create one.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    /// Edge environment.
    environment: Environment,
    /// Address overriding the environment's.
    address: Option<String>,
    /// Timers and trust.
    config: SessionConfig,
    /// Host to reach the edge through, and this session's mailbox.
    proxy: Option<(ContextHandle, Context)>,
    /// Mailbox to serve other sessions from.
    serve: Option<Context>,
}

// ============================================================================
// SessionBuilder Implementation
// ============================================================================

impl SessionBuilder {
    /// Creates a builder for the production environment.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the edge environment.
    #[inline]
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Overrides the edge address of the environment.
    ///
    /// # Arguments
    ///
    /// * `address` - `ws://` or `wss://` URL
    #[inline]
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the timers and trusted origins.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares the connection of the host at `host`.
    ///
    /// `context` is this session's own mailbox. The session falls back to a
    /// direct connection when the host origin is not trusted or the host
    /// never answers.
    #[inline]
    #[must_use]
    pub fn proxy_via(mut self, host: ContextHandle, context: Context) -> Self {
        self.proxy = Some((host, context));
        self
    }

    /// Serves other sessions from `context` over this session's connection.
    #[inline]
    #[must_use]
    pub fn serve(mut self, context: Context) -> Self {
        self.serve = Some(context);
        self
    }

    /// Builds and starts the session.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the address does not parse
    /// - [`Error::Config`] if the address is not `ws`/`wss`, a timer is zero,
    ///   or the session both proxies and serves
    /// - [`Error::Regex`] if a trusted origin pattern does not compile
    pub fn build(self) -> Result<Session> {
        let address = self.validate_address()?;
        self.config.validate()?;
        self.validate_mode()?;
        let policy = self.config.origin_policy()?;

        let Self {
            environment,
            config,
            proxy,
            serve,
            ..
        } = self;

        let client = match proxy {
            Some((host, context)) if policy.allows(host.origin()) => {
                info!(host = %host.id(), origin = host.origin(), "Session proxied");
                spawn_consumer(context, host, config.consumer_config())
            }
            Some((host, _)) => {
                info!(origin = host.origin(), "Proxy host untrusted, connecting directly");
                Self::direct(&address, &config)
            }
            None => Self::direct(&address, &config),
        };

        let host = serve.map(|context| Self::host(context, &client, policy, &config));

        Ok(Session::start(environment, address, config, client, host))
    }
}

// ============================================================================
// Spawning
// ============================================================================

impl SessionBuilder {
    fn direct(address: &Url, config: &SessionConfig) -> ClientHandle {
        debug!(%address, "Session direct");
        spawn_direct(
            address.clone(),
            config.transport_config(),
            config.coordinator_config(),
        )
    }

    fn host(
        context: Context,
        client: &ClientHandle,
        policy: OriginPolicy,
        config: &SessionConfig,
    ) -> ProxyHostHandle {
        ProxyHost::spawn(context, client.clone(), policy, config.orphan_sweep_interval)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl SessionBuilder {
    /// Resolves and checks the edge address.
    fn validate_address(&self) -> Result<Url> {
        let raw = self
            .address
            .as_deref()
            .unwrap_or_else(|| self.environment.address());
        let url = Url::parse(raw)?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Edge address must use ws:// or wss://, got '{raw}'.\n\
                 Example: Session::builder().address(\"wss://pubsub-edge.twitch.tv:443/v1\")"
            )));
        }

        #[cfg(not(feature = "tls"))]
        if url.scheme() == "wss" {
            return Err(Error::config(format!(
                "Edge address '{raw}' needs TLS, which this build lacks.\n\
                 Enable the `tls` feature or use a ws:// address"
            )));
        }

        Ok(url)
    }

    /// Checks that proxying and serving are not combined.
    fn validate_mode(&self) -> Result<()> {
        if self.proxy.is_some() && self.serve.is_some() {
            return Err(Error::config(
                "A session cannot both proxy through a host and serve other sessions",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
