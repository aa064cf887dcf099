use crate::identity::IdentitySourceError;
use crate::peer::PeerIdentityError;
use std::time::Duration;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `spiffe-mtls-demo`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The identity source failed or is not usable.
    #[error(transparent)]
    Identity(#[from] IdentitySourceError),

    /// No identity could be extracted from a peer certificate.
    #[error("peer identity: {0}")]
    Peer(#[from] PeerIdentityError),

    /// A string is not a well-formed SPIFFE ID.
    #[error("invalid SPIFFE ID {0}")]
    InvalidIdentity(String),

    /// The current identity document has no trust bundle for the peer's trust domain.
    #[error("no trust bundle for trust domain {0}")]
    NoBundle(String),

    /// Failed to create a `rustls::sign::CertifiedKey` from the identity document.
    #[error("failed building rustls certified key: {0}")]
    CertifiedKey(String),

    /// Failed to build a rustls verifier.
    #[error("rustls verifier builder error: {0}")]
    VerifierBuilder(String),

    /// The authorization policy rejected the peer.
    #[error("peer {0} is not authorized")]
    Unauthorized(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The TLS handshake did not complete in time.
    #[error("tls handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The listen address could not be bound.
    #[error("failed binding {address}: {source}")]
    Bind {
        /// Address that was requested.
        address: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The server address could not be reached.
    #[error("failed connecting to {address}: {source}")]
    Connect {
        /// Address that was dialed.
        address: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// A rustls error occurred.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Maps a failed `tokio-rustls` handshake back to a crate error.
    ///
    /// Errors raised by this crate's verifiers travel through rustls as
    /// `rustls::Error::Other`; those are unwrapped so callers see
    /// [`Error::Unauthorized`] and friends instead of an opaque I/O error.
    pub(crate) fn from_handshake(err: std::io::Error) -> Self {
        let own = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(|tls| match tls {
                rustls::Error::Other(other) => other.0.downcast_ref::<Error>(),
                _ => None,
            })
            .and_then(Error::clone_verifier_error);

        own.unwrap_or(Error::Handshake(err))
    }

    fn clone_verifier_error(&self) -> Option<Self> {
        match self {
            Error::Unauthorized(id) => Some(Error::Unauthorized(id.clone())),
            Error::NoBundle(td) => Some(Error::NoBundle(td.clone())),
            Error::InvalidIdentity(id) => Some(Error::InvalidIdentity(id.clone())),
            Error::Peer(e) => Some(Error::Peer(e.clone())),
            _ => None,
        }
    }

    /// Returns `true` if the peer was rejected by an authorization policy.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}
