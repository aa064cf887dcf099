use super::agent::{DocumentStream, IdentityAgent};
use super::document::IdentityDocument;
use super::errors::AgentError;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::StreamExt as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Session = mpsc::UnboundedSender<Result<IdentityDocument, AgentError>>;

/// An in-process identity agent driven by the caller.
///
/// Documents handed to [`StaticAgent::publish`] are pushed to every open
/// session, and a new session starts with the latest published document, like
/// the Workload API does. Useful for tests and for running without SPIRE.
#[derive(Clone, Default)]
pub struct StaticAgent {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    latest: Option<IdentityDocument>,
    sessions: Vec<Session>,
    unreachable: bool,
    connects: usize,
}

impl StaticAgent {
    /// Creates an agent with no document yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an agent that already holds `document`.
    pub fn with_document(document: IdentityDocument) -> Self {
        let agent = Self::new();
        agent.lock().latest = Some(document);
        agent
    }

    /// Publishes a new document (rotation).
    pub fn publish(&self, document: IdentityDocument) {
        let mut state = self.lock();
        state
            .sessions
            .retain(|s| s.unbounded_send(Ok(document.clone())).is_ok());
        state.latest = Some(document);
    }

    /// Sends an error to every open session, which ends them.
    pub fn fail(&self, error: AgentError) {
        let mut state = self.lock();
        for session in state.sessions.drain(..) {
            let _ = session.unbounded_send(Err(error.clone()));
        }
    }

    /// Closes every open session without an error.
    pub fn disconnect(&self) {
        self.lock().sessions.clear();
    }

    /// Makes subsequent `connect` calls fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Number of successful `connect` calls so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdentityAgent for StaticAgent {
    fn connect(&self) -> BoxFuture<'_, Result<DocumentStream, AgentError>> {
        let result = {
            let mut state = self.lock();
            if state.unreachable {
                Err(AgentError::Connect("static agent is unreachable".into()))
            } else {
                let (tx, rx) = mpsc::unbounded();
                if let Some(latest) = &state.latest {
                    let _ = tx.unbounded_send(Ok(latest.clone()));
                }
                state.sessions.push(tx);
                state.connects += 1;
                Ok(rx.boxed())
            }
        };
        Box::pin(futures::future::ready(result))
    }
}

impl std::fmt::Debug for StaticAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StaticAgent")
            .field("latest", &state.latest.as_ref().map(IdentityDocument::spiffe_id))
            .field("sessions", &state.sessions.len())
            .field("unreachable", &state.unreachable)
            .finish()
    }
}
