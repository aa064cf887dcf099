//! Authorization policies for peer identities.
//!
//! A policy runs inside the TLS handshake, **after** the peer certificate chain
//! has been verified against the trust bundle of its trust domain. Rejection
//! aborts the handshake before any application data is exchanged.

use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use spiffe::SpiffeId;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The peer is trusted.
    Accept,
    /// The peer is refused; the handshake is aborted.
    Reject,
}

impl Decision {
    /// Returns `true` for [`Decision::Accept`].
    pub fn is_accept(self) -> bool {
        matches!(self, Decision::Accept)
    }

    fn accept_if(cond: bool) -> Self {
        if cond {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }
}

/// Decides whether a peer may complete the handshake.
///
/// `peer_identity` is the identity URI of the leaf certificate exactly as it is
/// encoded, and `peer_chain` is the presented chain, leaf first.
/// Implementations must be thread-safe and must reject an empty chain.
pub trait AuthorizationPolicy: Send + Sync + 'static {
    /// Evaluates the peer.
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision;
}

impl<F> AuthorizationPolicy for F
where
    F: Fn(&str, &[CertificateDer<'_>]) -> Decision + Send + Sync + 'static,
{
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        if peer_chain.is_empty() {
            return Decision::Reject;
        }
        self(peer_identity, peer_chain)
    }
}

impl AuthorizationPolicy for Arc<dyn AuthorizationPolicy> {
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        (**self).evaluate(peer_identity, peer_chain)
    }
}

impl AuthorizationPolicy for Box<dyn AuthorizationPolicy> {
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        (**self).evaluate(peer_identity, peer_chain)
    }
}

/// Accepts any peer whose chain verified (authentication only).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAny;

impl AuthorizationPolicy for AllowAny {
    fn evaluate(&self, _peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        Decision::accept_if(!peer_chain.is_empty())
    }
}

/// Accepts only the peer whose identity equals the expected one.
///
/// The comparison is plain string equality: no case folding, no trailing-slash
/// normalization, no prefix or wildcard matching.
#[derive(Debug, Clone)]
pub struct AllowExact {
    expected: Arc<str>,
}

impl AllowExact {
    /// Creates the policy, validating that `expected` is a SPIFFE ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] if `expected` does not parse.
    pub fn new(expected: &str) -> Result<Self> {
        let id = parse_identity(expected)?;
        Ok(Self::from_id(&id))
    }

    /// Creates the policy from an already parsed SPIFFE ID.
    pub fn from_id(expected: &SpiffeId) -> Self {
        Self {
            expected: Arc::from(expected.to_string()),
        }
    }

    /// The identity this policy accepts.
    pub fn expected(&self) -> &str {
        &self.expected
    }
}

impl AuthorizationPolicy for AllowExact {
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        Decision::accept_if(!peer_chain.is_empty() && peer_identity == &*self.expected)
    }
}

/// Accepts peers whose identity is one of a fixed set, compared exactly.
///
/// An empty list accepts nothing.
#[derive(Debug, Clone)]
pub struct AllowList {
    allowed: Arc<BTreeSet<String>>,
}

impl AllowList {
    /// Creates the policy, validating every entry as a SPIFFE ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] for the first entry that does not parse.
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for id in ids {
            let id = parse_identity(id.as_ref())?;
            allowed.insert(id.to_string());
        }
        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }

    /// Number of allowed identities.
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Returns `true` if nothing is allowed.
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl AuthorizationPolicy for AllowList {
    fn evaluate(&self, peer_identity: &str, peer_chain: &[CertificateDer<'_>]) -> Decision {
        Decision::accept_if(!peer_chain.is_empty() && self.allowed.contains(peer_identity))
    }
}

/// Returns a policy that accepts any verified peer.
pub fn allow_any() -> AllowAny {
    AllowAny
}

/// Returns a policy that accepts exactly `expected`.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentity`] if `expected` is not a SPIFFE ID.
///
/// # Examples
///
/// ```rust
/// use spiffe_mtls_demo::policy;
///
/// let policy = policy::allow_exact("spiffe://example.org/server")?;
/// assert_eq!(policy.expected(), "spiffe://example.org/server");
/// # Ok::<(), spiffe_mtls_demo::Error>(())
/// ```
pub fn allow_exact(expected: &str) -> Result<AllowExact> {
    AllowExact::new(expected)
}

/// Returns a policy accepting the listed identities.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentity`] if any entry is not a SPIFFE ID.
pub fn allow_list<I, S>(ids: I) -> Result<AllowList>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    AllowList::new(ids)
}

pub(crate) fn parse_identity(id: &str) -> Result<SpiffeId> {
    SpiffeId::new(id).map_err(|e| Error::InvalidIdentity(format!("{id}: {e}")))
}
