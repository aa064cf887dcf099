use super::verifier::SpiffeClientCertVerifier;
use super::watcher::{MaterialProvider, MaterialWatcher};
use crate::error::Result;
use crate::identity::IdentitySource;
use crate::policy::{AllowAny, AuthorizationPolicy};
use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use std::sync::Arc;

/// Builds a [`rustls::ServerConfig`] backed by a live [`IdentitySource`].
///
/// The resulting server configuration:
///
/// * presents the current identity document as the server certificate
/// * requires a client certificate and verifies it against the bundle of the
///   client's trust domain
/// * authorizes the client identity with the configured policy
///
/// New handshakes pick up rotated documents automatically.
///
/// # Examples
///
/// ```no_run
/// use spiffe_mtls_demo::{policy, tls, IdentitySource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
/// let config = tls::mtls_server(source)
///     .authorize(policy::allow_list(["spiffe://example.org/client"])?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ServerConfigBuilder {
    source: IdentitySource,
    policy: Arc<dyn AuthorizationPolicy>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ServerConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigBuilder")
            .field("source", &self.source)
            .field("policy", &"<Arc<dyn AuthorizationPolicy>>")
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl ServerConfigBuilder {
    /// Creates a builder that accepts any verified client.
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            policy: Arc::new(AllowAny),
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the policy applied to client identities.
    #[must_use]
    pub fn authorize<P: AuthorizationPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets the ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Builds the `rustls::ServerConfig`.
    ///
    /// Must be called from within a Tokio runtime; a background task follows
    /// document rotations.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has no document yet or the rustls
    /// material cannot be built from it.
    pub fn build(self) -> Result<ServerConfig> {
        crate::crypto::ensure_crypto_provider_installed();

        let watcher = MaterialWatcher::spawn(self.source)?;

        let resolver: Arc<dyn ResolvesServerCert> =
            Arc::new(resolve_server::SpiffeServerCertResolver {
                watcher: watcher.clone(),
            });

        let verifier = Arc::new(SpiffeClientCertVerifier::new(
            Arc::new(watcher) as Arc<dyn MaterialProvider>,
            self.policy,
        ));

        let mut cfg = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver);
        cfg.alpn_protocols = self.alpn_protocols;

        Ok(cfg)
    }
}

/// Starts a [`ServerConfigBuilder`] for `source`.
pub fn mtls_server(source: IdentitySource) -> ServerConfigBuilder {
    ServerConfigBuilder::new(source)
}

mod resolve_server {
    use crate::tls::watcher::MaterialWatcher;
    use rustls::server::{ClientHello, ResolvesServerCert};
    use rustls::sign::CertifiedKey;
    use std::sync::Arc;

    #[derive(Clone, Debug)]
    pub(crate) struct SpiffeServerCertResolver {
        pub watcher: MaterialWatcher,
    }

    impl ResolvesServerCert for SpiffeServerCertResolver {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            Some(Arc::clone(&self.watcher.current().certified_key))
        }
    }
}
