use super::agent::{IdentityAgent, WorkloadApiAgent};
use super::errors::IdentitySourceError;
use super::source::IdentitySource;
use crate::prelude::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Agent socket used when neither the builder nor `SPIFFE_ENDPOINT_SOCKET` names one.
pub const DEFAULT_AGENT_SOCKET: &str = "unix:///tmp/agent.sock";

/// Environment variable holding the Workload API socket address.
pub const ENDPOINT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Reconnect backoff for the background refresh.
///
/// After a session with the agent ends, the source reconnects with exponential
/// backoff between `min_backoff` and `max_backoff`, with a small jitter.
///
/// If `min_backoff > max_backoff`, they are swapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Initial delay before reconnecting.
    pub min_backoff: Duration,
    /// Maximum delay between reconnects.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

/// Builder for [`IdentitySource`].
///
/// # Example
///
/// ```no_run
/// use spiffe_mtls_demo::IdentitySource;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::builder()
///     .endpoint("unix:///tmp/agent.sock")
///     .ready_timeout(Duration::from_secs(10))
///     .build()
///     .await?;
///
/// println!("running as {}", source.current()?.spiffe_id());
/// source.close().await;
/// # Ok(())
/// # }
/// ```
pub struct IdentitySourceBuilder {
    agent: Option<Arc<dyn IdentityAgent>>,
    reconnect: ReconnectConfig,
    ready_timeout: Duration,
    shutdown_timeout: Option<Duration>,
}

impl std::fmt::Debug for IdentitySourceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySourceBuilder")
            .field("agent", &self.agent.as_ref().map(|_| "<IdentityAgent>"))
            .field("reconnect", &self.reconnect)
            .field("ready_timeout", &self.ready_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Default for IdentitySourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySourceBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            agent: None,
            reconnect: ReconnectConfig::default(),
            ready_timeout: Duration::from_secs(30),
            shutdown_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Uses `agent` instead of the Workload API.
    #[must_use]
    pub fn agent(mut self, agent: impl IdentityAgent) -> Self {
        self.agent = Some(Arc::new(agent));
        self
    }

    /// Talks to the Workload API at `endpoint`.
    #[must_use]
    pub fn endpoint(self, endpoint: impl Into<String>) -> Self {
        self.agent(WorkloadApiAgent::new(endpoint))
    }

    /// Sets the reconnect backoff bounds.
    #[must_use]
    pub fn reconnect_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.reconnect = ReconnectConfig {
            min_backoff,
            max_backoff,
        };
        self
    }

    /// How long [`build`](Self::build) waits for the first document.
    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Bound on joining the background task in [`IdentitySource::close`].
    ///
    /// `None` waits indefinitely.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Opens the session with the agent without waiting for a document.
    ///
    /// [`IdentitySource::current`] returns `NotReady` until the first document
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns [`IdentitySourceError::Connection`] if the agent is unreachable.
    pub async fn connect(self) -> Result<IdentitySource, IdentitySourceError> {
        let agent = self.agent.unwrap_or_else(default_agent);
        IdentitySource::start(
            agent,
            self.reconnect.normalize(),
            self.shutdown_timeout,
        )
        .await
    }

    /// Opens the session and waits for the first document.
    ///
    /// # Errors
    ///
    /// Returns [`IdentitySourceError::Connection`] if the agent is unreachable,
    /// [`IdentitySourceError::NoDocument`] if the first fetch fails and
    /// [`IdentitySourceError::ReadyTimeout`] if nothing arrives in time. The
    /// session is closed before the error is returned.
    pub async fn build(self) -> Result<IdentitySource, IdentitySourceError> {
        let ready_timeout = self.ready_timeout;
        let source = self.connect().await?;

        match source.wait_ready(ready_timeout).await {
            Ok(document) => {
                info!("Identity source ready: spiffe_id={}", document.spiffe_id());
                Ok(source)
            }
            Err(e) => {
                warn!("Identity source failed to become ready: error={e}");
                source.close().await;
                Err(e)
            }
        }
    }
}

fn default_agent() -> Arc<dyn IdentityAgent> {
    let endpoint =
        std::env::var(ENDPOINT_SOCKET_ENV).unwrap_or_else(|_| DEFAULT_AGENT_SOCKET.to_owned());
    Arc::new(WorkloadApiAgent::new(endpoint))
}
