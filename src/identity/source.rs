use super::agent::{DocumentStream, IdentityAgent};
use super::builder::{IdentitySourceBuilder, ReconnectConfig};
use super::document::IdentityDocument;
use super::errors::{AgentError, IdentitySourceError};
use crate::prelude::warn;
use arc_swap::ArcSwapOption;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Lifecycle state published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Status {
    /// Session open, no document yet.
    Pending,
    /// A document is available; the value is its generation (starting at 1).
    Ready(u64),
    /// The session failed before the first document.
    Failed(AgentError),
    /// The source was closed.
    Closed,
}

/// Handle for observing document rotations of an [`IdentitySource`].
///
/// Each applied document bumps a generation number. The first document has
/// generation 1; `0` means no document yet. Slow receivers may skip
/// intermediate generations.
#[derive(Clone, Debug)]
pub struct IdentityUpdates {
    rx: watch::Receiver<Status>,
}

impl IdentityUpdates {
    /// Waits for the next change and returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns [`IdentitySourceError::NoDocument`] if the first fetch failed and
    /// [`IdentitySourceError::Closed`] once the source is closed.
    pub async fn changed(&mut self) -> Result<u64, IdentitySourceError> {
        loop {
            self.rx
                .changed()
                .await
                .map_err(|_| IdentitySourceError::Closed)?;
            if let Some(generation) = self.current()? {
                return Ok(generation);
            }
        }
    }

    /// Returns the last generation without waiting.
    pub fn last(&self) -> u64 {
        match *self.rx.borrow() {
            Status::Ready(generation) => generation,
            _ => 0,
        }
    }

    /// Waits until the generation satisfies `f`, checking the current value first.
    ///
    /// # Errors
    ///
    /// Same as [`changed`](Self::changed).
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, IdentitySourceError>
    where
        F: FnMut(u64) -> bool,
    {
        if let Some(generation) = self.current()? {
            if f(generation) {
                return Ok(generation);
            }
        }
        loop {
            let generation = self.changed().await?;
            if f(generation) {
                return Ok(generation);
            }
        }
    }

    fn current(&mut self) -> Result<Option<u64>, IdentitySourceError> {
        match &*self.rx.borrow_and_update() {
            Status::Pending => Ok(None),
            Status::Ready(generation) => Ok(Some(*generation)),
            Status::Failed(e) => Err(IdentitySourceError::NoDocument(e.clone())),
            Status::Closed => Err(IdentitySourceError::Closed),
        }
    }
}

/// Live identity of this process, kept fresh by a background task.
///
/// The source talks to an [`IdentityAgent`] (the SPIFFE Workload API by
/// default). Every document the agent pushes replaces the previous one
/// atomically; readers always see a complete document.
///
/// Clones share the same background task. Dropping the last clone cancels it;
/// [`close`](Self::close) also waits for it to finish.
#[derive(Clone, Debug)]
pub struct IdentitySource {
    inner: Arc<Inner>,
    _cancel_on_drop: Arc<DropGuard>,
}

pub(super) struct Inner {
    document: ArcSwapOption<IdentityDocument>,

    agent: Arc<dyn IdentityAgent>,
    reconnect: ReconnectConfig,

    closed: AtomicBool,
    cancel: CancellationToken,
    shutdown_timeout: Option<Duration>,

    generation: AtomicU64,
    status_tx: watch::Sender<Status>,
    status_rx: watch::Receiver<Status>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySource")
            .field(
                "spiffe_id",
                &self.document.load().as_ref().map(|d| d.spiffe_id().to_string()),
            )
            .field("agent", &"<IdentityAgent>")
            .field("reconnect", &self.reconnect)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Connects to the Workload API at `endpoint` and waits for the first document.
    ///
    /// # Errors
    ///
    /// See [`IdentitySourceBuilder::build`].
    pub async fn open(endpoint: impl Into<String>) -> Result<Self, IdentitySourceError> {
        IdentitySourceBuilder::new().endpoint(endpoint).build().await
    }

    /// Creates a builder for configuring an [`IdentitySource`].
    pub fn builder() -> IdentitySourceBuilder {
        IdentitySourceBuilder::new()
    }

    /// Returns the latest identity document.
    ///
    /// # Errors
    ///
    /// Returns [`IdentitySourceError::NotReady`] before the first document has
    /// been received and [`IdentitySourceError::Closed`] after
    /// [`close`](Self::close).
    pub fn current(&self) -> Result<Arc<IdentityDocument>, IdentitySourceError> {
        self.assert_open()?;
        self.inner
            .document
            .load_full()
            .ok_or(IdentitySourceError::NotReady)
    }

    /// Waits up to `timeout` for the first document and returns it.
    ///
    /// Returns immediately if a document is already available.
    ///
    /// # Errors
    ///
    /// [`IdentitySourceError::NoDocument`] if the first fetch failed,
    /// [`IdentitySourceError::ReadyTimeout`] if nothing arrived in time and
    /// [`IdentitySourceError::Closed`] if the source was closed.
    pub async fn wait_ready(
        &self,
        timeout: Duration,
    ) -> Result<Arc<IdentityDocument>, IdentitySourceError> {
        let mut updates = self.updated();
        match tokio::time::timeout(timeout, updates.wait_for(|g| g > 0)).await {
            Ok(Ok(_)) => self.current(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IdentitySourceError::ReadyTimeout(timeout)),
        }
    }

    /// Returns a handle for observing document rotations.
    pub fn updated(&self) -> IdentityUpdates {
        let mut rx = self.inner.status_rx.clone();
        rx.borrow_and_update();
        IdentityUpdates { rx }
    }

    /// Returns `true` if the source is open and holds a document.
    pub fn is_ready(&self) -> bool {
        self.current().is_ok()
    }

    /// Generation of the current document; `0` before the first one.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Stops the background task and waits for it, bounded by the configured
    /// shutdown timeout.
    ///
    /// Idempotent. Afterwards [`current`](Self::current) returns
    /// [`IdentitySourceError::Closed`].
    pub async fn close(&self) {
        let result = match self.inner.shutdown_timeout {
            Some(timeout) => self.close_with_timeout(timeout).await,
            None => {
                self.close_unbounded().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Identity source did not close cleanly: error={e}");
        }
    }

    /// Stops the background task, aborting it if it does not finish within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentitySourceError::ShutdownTimeout`] if the task had to be aborted.
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<(), IdentitySourceError> {
        if !self.begin_close() {
            return Ok(());
        }

        let handle = self.inner.supervisor.lock().await.take();
        let result = match handle {
            None => Ok(()),
            Some(mut handle) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!("Error joining identity supervisor during close: error={e}");
                    Ok(())
                }
                Err(_) => {
                    warn!("Close timeout exceeded; aborting identity supervisor");
                    handle.abort();
                    let _ = handle.await;
                    Err(IdentitySourceError::ShutdownTimeout)
                }
            },
        };

        let _ = self.inner.status_tx.send_replace(Status::Closed);
        result
    }

    async fn close_unbounded(&self) {
        if !self.begin_close() {
            return;
        }
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Error joining identity supervisor during close: error={e}");
            }
        }
        let _ = self.inner.status_tx.send_replace(Status::Closed);
    }

    /// Marks the source closed; returns `false` if it already was.
    fn begin_close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.cancel.cancel();
        true
    }

    fn assert_open(&self) -> Result<(), IdentitySourceError> {
        if self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled() {
            return Err(IdentitySourceError::Closed);
        }
        Ok(())
    }

    /// Opens the first session with `agent` and spawns the supervisor on it.
    pub(super) async fn start(
        agent: Arc<dyn IdentityAgent>,
        reconnect: ReconnectConfig,
        shutdown_timeout: Option<Duration>,
    ) -> Result<Self, IdentitySourceError> {
        let first: DocumentStream = agent
            .connect()
            .await
            .map_err(IdentitySourceError::Connection)?;

        let (status_tx, status_rx) = watch::channel(Status::Pending);
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            document: ArcSwapOption::empty(),
            agent,
            reconnect,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            shutdown_timeout,
            generation: AtomicU64::new(0),
            status_tx,
            status_rx,
            supervisor: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            task_inner.run_supervisor(first, token).await;
        });
        *inner.supervisor.lock().await = Some(handle);

        Ok(Self {
            inner,
            _cancel_on_drop: Arc::new(cancel.drop_guard()),
        })
    }
}

impl Inner {
    pub(super) fn reconnect(&self) -> ReconnectConfig {
        self.reconnect
    }

    pub(super) fn agent(&self) -> &dyn IdentityAgent {
        &*self.agent
    }

    pub(super) fn has_document(&self) -> bool {
        self.document.load().is_some()
    }

    /// Publishes `document` as the current one.
    pub(super) fn apply_update(&self, document: IdentityDocument) -> u64 {
        self.document.store(Some(Arc::new(document)));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.status_tx.send_replace(Status::Ready(generation));
        generation
    }

    /// Records that the first session failed before delivering a document.
    pub(super) fn fail_initial(&self, error: AgentError) {
        let _ = self.status_tx.send_replace(Status::Failed(error));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::StaticAgent;
    use crate::testing::TestCa;

    fn builder(agent: &StaticAgent) -> IdentitySourceBuilder {
        IdentitySource::builder()
            .agent(agent.clone())
            .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
            .ready_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn current_is_not_ready_before_first_document() {
        let agent = StaticAgent::new();
        let source = builder(&agent).connect().await.unwrap();

        assert_eq!(source.current().unwrap_err(), IdentitySourceError::NotReady);
        assert!(!source.is_ready());
        assert_eq!(source.generation(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn first_document_makes_source_ready() {
        let ca = TestCa::new("example.org");
        let agent = StaticAgent::new();
        let source = builder(&agent).connect().await.unwrap();

        agent.publish(ca.document("spiffe://example.org/server"));
        let document = source.wait_ready(Duration::from_secs(5)).await.unwrap();

        let id = document.spiffe_id().to_string();
        assert_eq!(id, "spiffe://example.org/server");
        assert_eq!(spiffe::SpiffeId::new(&id).unwrap().to_string(), id);
        assert_eq!(source.generation(), 1);
        source.close().await;
    }

    #[tokio::test]
    async fn rotation_replaces_document() {
        let ca = TestCa::new("example.org");
        let agent = StaticAgent::with_document(ca.document("spiffe://example.org/v1"));
        let source = builder(&agent).build().await.unwrap();
        let mut updates = source.updated();
        assert_eq!(updates.last(), 1);

        agent.publish(ca.document("spiffe://example.org/v2"));
        assert_eq!(updates.changed().await.unwrap(), 2);
        assert_eq!(
            source.current().unwrap().spiffe_id().to_string(),
            "spiffe://example.org/v2"
        );
        source.close().await;
    }

    #[tokio::test]
    async fn unreachable_agent_is_connection_error() {
        let agent = StaticAgent::new();
        agent.set_unreachable(true);

        let err = builder(&agent).build().await.unwrap_err();
        assert!(matches!(err, IdentitySourceError::Connection(AgentError::Connect(_))));
    }

    #[tokio::test]
    async fn initial_failure_is_fatal_without_retry() {
        let agent = StaticAgent::new();
        let source = builder(&agent).connect().await.unwrap();

        agent.fail(AgentError::Stream("permission denied".into()));
        let err = source.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            IdentitySourceError::NoDocument(AgentError::Stream("permission denied".into()))
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.connects(), 1);
        source.close().await;
    }

    #[tokio::test]
    async fn stream_ending_before_first_document_is_no_document() {
        let agent = StaticAgent::new();
        let source = builder(&agent).connect().await.unwrap();

        agent.disconnect();
        let err = source.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, IdentitySourceError::NoDocument(AgentError::Disconnected));
        source.close().await;
    }

    #[tokio::test]
    async fn ready_timeout_when_nothing_arrives() {
        let agent = StaticAgent::new();
        let err = builder(&agent)
            .ready_timeout(Duration::from_millis(50))
            .build()
            .await
            .unwrap_err();
        assert_eq!(err, IdentitySourceError::ReadyTimeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn reconnects_after_first_document_and_keeps_last_good() {
        let ca = TestCa::new("example.org");
        let agent = StaticAgent::with_document(ca.document("spiffe://example.org/a"));
        let source = builder(&agent).build().await.unwrap();
        let mut updates = source.updated();

        agent.fail(AgentError::Stream("reset".into()));
        assert_eq!(
            source.current().unwrap().spiffe_id().to_string(),
            "spiffe://example.org/a"
        );

        // The new session replays the latest document.
        assert_eq!(updates.changed().await.unwrap(), 2);
        assert!(agent.connects() >= 2);
        source.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let ca = TestCa::new("example.org");
        let agent = StaticAgent::with_document(ca.document("spiffe://example.org/a"));
        let source = builder(&agent).build().await.unwrap();
        let mut updates = source.updated();

        source.close().await;
        source.close().await;
        source
            .close_with_timeout(Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(source.current().unwrap_err(), IdentitySourceError::Closed);
        assert!(!source.is_ready());
        assert_eq!(
            updates.changed().await.unwrap_err(),
            IdentitySourceError::Closed
        );
    }
}
