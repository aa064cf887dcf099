use std::time::Duration;

/// Errors produced by an [`IdentityAgent`](super::IdentityAgent).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent endpoint is unreachable or misconfigured.
    #[error("failed connecting to identity agent: {0}")]
    Connect(String),

    /// The update stream failed after it was established.
    #[error("identity agent stream error: {0}")]
    Stream(String),

    /// The agent sent material that does not form a usable identity document.
    #[error("identity agent sent an unusable document: {0}")]
    Document(String),

    /// The agent closed the update stream.
    #[error("identity agent closed the stream")]
    Disconnected,
}

/// Errors returned by [`IdentitySource`](super::IdentitySource).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentitySourceError {
    /// The session with the identity agent could not be established.
    #[error("identity agent connection failed: {0}")]
    Connection(#[source] AgentError),

    /// No identity document has been fetched yet.
    #[error("no identity document has been fetched yet")]
    NotReady,

    /// The first identity document could not be obtained.
    #[error("no identity document obtainable: {0}")]
    NoDocument(#[source] AgentError),

    /// The first identity document did not arrive in time.
    #[error("timed out after {0:?} waiting for the first identity document")]
    ReadyTimeout(Duration),

    /// The source is closed.
    #[error("identity source is closed")]
    Closed,

    /// Closing did not finish in time; the background task was aborted.
    #[error("identity source shutdown timed out")]
    ShutdownTimeout,
}

/// Reasons an [`IdentityDocument`](super::IdentityDocument) cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// The certificate chain is empty.
    #[error("certificate chain is empty")]
    EmptyChain,

    /// The private key is empty.
    #[error("private key is empty")]
    EmptyKey,

    /// The leaf certificate has no usable identity URI.
    #[error("leaf certificate identity: {0}")]
    Identity(#[from] crate::peer::PeerIdentityError),

    /// The leaf identity URI is not a SPIFFE ID.
    #[error("leaf identity {0} is not a SPIFFE ID")]
    InvalidIdentity(String),

    /// There is no trust bundle for the document's own trust domain.
    #[error("no trust bundle for own trust domain {0}")]
    MissingBundle(String),
}
