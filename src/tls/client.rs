use super::verifier::SpiffeServerCertVerifier;
use super::watcher::{MaterialProvider, MaterialWatcher};
use crate::error::Result;
use crate::identity::IdentitySource;
use crate::policy::{AllowAny, AuthorizationPolicy};
use rustls::client::ResolvesClientCert;
use rustls::ClientConfig;
use std::sync::Arc;

/// Builds a [`rustls::ClientConfig`] backed by a live [`IdentitySource`].
///
/// The client presents the current identity document, verifies the server
/// chain against the bundle of the server's trust domain and authorizes the
/// server identity with the configured policy. The TLS server name is not
/// checked; identity is carried by the URI SAN.
pub struct ClientConfigBuilder {
    source: IdentitySource,
    policy: Arc<dyn AuthorizationPolicy>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("source", &self.source)
            .field("policy", &"<Arc<dyn AuthorizationPolicy>>")
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl ClientConfigBuilder {
    /// Creates a builder that accepts any verified server.
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            policy: Arc::new(AllowAny),
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the policy applied to the server identity.
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

    /// Builds the `rustls::ClientConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has no document yet or the rustls
    /// material cannot be built from it.
    pub fn build(self) -> Result<ClientConfig> {
        crate::crypto::ensure_crypto_provider_installed();

        let watcher = MaterialWatcher::spawn(self.source)?;

        let resolver: Arc<dyn ResolvesClientCert> =
            Arc::new(resolve_client::SpiffeClientCertResolver {
                watcher: watcher.clone(),
            });

        let verifier = Arc::new(SpiffeServerCertVerifier::new(
            Arc::new(watcher) as Arc<dyn MaterialProvider>,
            self.policy,
        ));

        let mut cfg = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver);
        cfg.alpn_protocols = self.alpn_protocols;

        Ok(cfg)
    }
}

/// Starts a [`ClientConfigBuilder`] for `source`.
pub fn mtls_client(source: IdentitySource) -> ClientConfigBuilder {
    ClientConfigBuilder::new(source)
}

mod resolve_client {
    use crate::tls::watcher::MaterialWatcher;
    use rustls::client::ResolvesClientCert;
    use rustls::sign::CertifiedKey;
    use std::sync::Arc;

    #[derive(Clone, Debug)]
    pub(crate) struct SpiffeClientCertResolver {
        pub watcher: MaterialWatcher,
    }

    impl ResolvesClientCert for SpiffeClientCertResolver {
        fn resolve(
            &self,
            _root_hint_subjects: &[&[u8]],
            _sigschemes: &[rustls::SignatureScheme],
        ) -> Option<Arc<CertifiedKey>> {
            Some(Arc::clone(&self.watcher.current().certified_key))
        }

        fn has_certs(&self) -> bool {
            true
        }
    }
}
